// Table definitions for the canonical history and the unfinalized recovery
// log. Kept in sync with the migrations managed by the deployment tooling.

diesel::table! {
    slots (slot, root) {
        slot -> Int8,
        root -> Bytea,
        parent_root -> Nullable<Bytea>,
        state_root -> Nullable<Bytea>,
        proposer -> Int8,
        status -> Int2,
        fork_id -> Int8,
        graffiti -> Nullable<Bytea>,
        graffiti_text -> Nullable<Text>,
        attestation_count -> Int4,
        deposit_count -> Int4,
        exit_count -> Int4,
        proposer_slashing_count -> Int4,
        attester_slashing_count -> Int4,
        bls_change_count -> Int4,
        sync_participation -> Float4,
        eth_block_number -> Nullable<Int8>,
        eth_block_hash -> Nullable<Bytea>,
        eth_block_extra -> Nullable<Bytea>,
        eth_block_extra_text -> Nullable<Text>,
        eth_transaction_count -> Int4,
        withdraw_count -> Int4,
        withdraw_amount -> Int8,
    }
}

diesel::table! {
    epochs (epoch) {
        epoch -> Int8,
        validator_count -> Int8,
        validator_balance -> Int8,
        eligible -> Int8,
        voted_target -> Int8,
        voted_head -> Int8,
        voted_total -> Int8,
        block_count -> Int2,
        missing_count -> Int2,
        orphaned_count -> Int2,
        attestation_count -> Int4,
        deposit_count -> Int4,
        exit_count -> Int4,
        proposer_slashing_count -> Int4,
        attester_slashing_count -> Int4,
        bls_change_count -> Int4,
        sync_participation -> Float4,
        eth_transaction_count -> Int4,
        withdraw_count -> Int4,
        withdraw_amount -> Int8,
    }
}

diesel::table! {
    deposits (slot_root, slot_index) {
        slot_root -> Bytea,
        slot_index -> Int4,
        slot_number -> Int8,
        orphaned -> Bool,
        fork_id -> Int8,
        deposit_index -> Nullable<Int8>,
        public_key -> Bytea,
        withdrawal_credentials -> Bytea,
        amount -> Int8,
    }
}

diesel::table! {
    voluntary_exits (slot_root, slot_index) {
        slot_root -> Bytea,
        slot_index -> Int4,
        slot_number -> Int8,
        orphaned -> Bool,
        fork_id -> Int8,
        validator_index -> Int8,
    }
}

diesel::table! {
    slashings (slot_root, slot_index) {
        slot_root -> Bytea,
        slot_index -> Int4,
        slot_number -> Int8,
        orphaned -> Bool,
        fork_id -> Int8,
        validator_index -> Int8,
        slasher_index -> Int8,
        reason -> Int2,
    }
}

diesel::table! {
    sync_assignments (period, committee_index) {
        period -> Int8,
        committee_index -> Int4,
        validator_index -> Int8,
    }
}

diesel::table! {
    unfinalized_blocks (root) {
        root -> Bytea,
        slot -> Int8,
        fork_id -> Int8,
        status -> Int2,
        header_ver -> Int2,
        header_ssz -> Bytea,
        block_ver -> Int2,
        block_ssz -> Bytea,
    }
}

diesel::table! {
    unfinalized_duties (epoch, dependent_root) {
        epoch -> Int8,
        dependent_root -> Bytea,
        duties_ssz -> Bytea,
    }
}

diesel::table! {
    unfinalized_epochs (epoch, dependent_root) {
        epoch -> Int8,
        dependent_root -> Bytea,
        epoch_data -> Jsonb,
    }
}

diesel::table! {
    unfinalized_forks (fork_id) {
        fork_id -> Int8,
        base_slot -> Int8,
        base_root -> Bytea,
        parent_fork_id -> Int8,
        head_slot -> Int8,
        head_root -> Bytea,
    }
}

diesel::table! {
    explorer_state (key) {
        key -> Text,
        value -> Jsonb,
    }
}

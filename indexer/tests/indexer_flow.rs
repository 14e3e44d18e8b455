//! End-to-end flow against a mock beacon node: head tracking, ancestor
//! backfill, deduplicated body loading and fork classification.

use async_trait::async_trait;
use beacon_indexer::beacon::{ForkKey, Indexer, ProcessingStatus};
use beacon_indexer::config::Config;
use beacon_indexer::consensus::{
    BlockId, ClientError, ConsensusClient, ConsensusPool, FinalityCheckpoints, FinalityEvent,
    HeadEvent, StateRef,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use types::{
    BeaconBlockBase, BeaconBlockBodyBase, BeaconBlockHeader, BeaconState, ChainSpec, Checkpoint,
    Epoch, Eth1Data, Graffiti, Hash256, SignatureBytes, SignedBeaconBlock, SignedBeaconBlockBase,
    SignedBeaconBlockHeader, Slot,
};

#[derive(Default)]
struct MockChain {
    headers: HashMap<Hash256, SignedBeaconBlockHeader>,
    bodies: HashMap<Hash256, SignedBeaconBlock>,
}

struct MockClient {
    chain: Arc<Mutex<MockChain>>,
    head_tx: Mutex<Option<mpsc::Sender<HeadEvent>>>,
    body_fetches: AtomicUsize,
}

impl MockClient {
    fn new(chain: Arc<Mutex<MockChain>>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            head_tx: Mutex::new(None),
            body_fetches: AtomicUsize::new(0),
        })
    }

    async fn push_head(&self, slot: Slot, root: Hash256) {
        let tx = self.head_tx.lock().clone().expect("subscribed");
        tx.send(HeadEvent { slot, root }).await.unwrap();
    }
}

#[async_trait]
impl ConsensusClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_header(
        &self,
        block_id: BlockId,
    ) -> Result<Option<SignedBeaconBlockHeader>, ClientError> {
        match block_id {
            BlockId::Root(root) => Ok(self.chain.lock().headers.get(&root).cloned()),
            _ => Err(ClientError::Unavailable("unsupported lookup".into())),
        }
    }

    async fn get_block_body(
        &self,
        root: Hash256,
    ) -> Result<Option<SignedBeaconBlock>, ClientError> {
        self.body_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.chain.lock().bodies.get(&root).cloned())
    }

    async fn get_beacon_state(&self, _state_ref: StateRef) -> Result<BeaconState, ClientError> {
        Err(ClientError::Unavailable("mock has no states".into()))
    }

    async fn get_finality_checkpoints(&self) -> Result<FinalityCheckpoints, ClientError> {
        Err(ClientError::Unavailable("mock has no finality".into()))
    }

    async fn subscribe_head_events(&self) -> Result<mpsc::Receiver<HeadEvent>, ClientError> {
        let (tx, rx) = mpsc::channel(16);
        *self.head_tx.lock() = Some(tx);
        Ok(rx)
    }
}

fn body(slot: u64, parent_root: Hash256) -> SignedBeaconBlock {
    SignedBeaconBlock::Base(SignedBeaconBlockBase {
        message: BeaconBlockBase {
            slot: Slot::new(slot),
            proposer_index: slot % 8,
            parent_root,
            state_root: Hash256::repeat_byte(0xfe),
            body: BeaconBlockBodyBase {
                randao_reveal: SignatureBytes::empty(),
                eth1_data: Eth1Data {
                    deposit_root: Hash256::zero(),
                    deposit_count: 0,
                    block_hash: Hash256::zero(),
                },
                graffiti: Graffiti::empty(),
                proposer_slashings: vec![],
                attester_slashings: vec![],
                attestations: vec![],
                deposits: vec![],
                voluntary_exits: vec![],
            },
        },
        signature: SignatureBytes::empty(),
    })
}

/// Build a chain of `count` blocks with real header roots, register it with
/// the mock node and return `(roots, tip)`.
fn seed_chain(chain: &Arc<Mutex<MockChain>>, count: u64) -> Vec<Hash256> {
    let mut roots = Vec::new();
    let mut parent = Hash256::zero();
    let mut locked = chain.lock();
    for slot in 1..=count {
        let header = SignedBeaconBlockHeader {
            message: BeaconBlockHeader {
                slot: Slot::new(slot),
                proposer_index: slot % 8,
                parent_root: parent,
                state_root: Hash256::repeat_byte(0xfe),
                body_root: Hash256::repeat_byte(slot as u8),
            },
            signature: SignatureBytes::empty(),
        };
        let root = header.canonical_root();
        locked.headers.insert(root, header);
        locked.bodies.insert(root, body(slot, parent));
        roots.push(root);
        parent = root;
    }
    roots
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn head_tracking_backfills_and_loads_bodies() {
    beacon_indexer::logger::init_logger("debug");

    let chain = Arc::new(Mutex::new(MockChain::default()));
    let roots = seed_chain(&chain, 6);
    let mock = MockClient::new(chain.clone());

    let pool = Arc::new(ConsensusPool::new(ChainSpec::minimal(), 0));
    let indexer = Indexer::new(pool.clone(), None, &Config::default());
    let client = indexer.add_client(0, mock.clone(), 1, false, false);
    tokio::spawn(client.run(indexer.clone()));

    // Wait for the subscription, then report the tip; the loop must walk
    // the parent chain back and index every ancestor.
    wait_for(|| mock.head_tx.lock().is_some()).await;
    mock.push_head(Slot::new(6), roots[5]).await;

    let cache = indexer.block_cache().clone();
    wait_for(|| cache.block_count() == 6).await;

    for (position, root) in roots.iter().enumerate() {
        let block = cache.get_block(root).expect("block cached");
        assert_eq!(block.slot, Slot::new(position as u64 + 1));
        assert!(block.header().is_some());
        assert_eq!(block.fork_id(), ForkKey::CANONICAL);
        // Bodies load in the background; either way the block is not final.
        assert!(matches!(
            block.status(),
            ProcessingStatus::Received | ProcessingStatus::Indexed
        ));
    }

    // Bodies are loaded lazily in the background, one fetch per root.
    wait_for(|| {
        roots
            .iter()
            .all(|root| cache.get_block(root).unwrap().body().is_some())
    })
    .await;
    assert_eq!(mock.body_fetches.load(Ordering::SeqCst), 6);

    // A repeated head report changes nothing.
    mock.push_head(Slot::new(6), roots[5]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.block_count(), 6);
    assert_eq!(mock.body_fetches.load(Ordering::SeqCst), 6);

    // With the chain connected, finality can select and mark the canonical
    // epoch (no duty stats: persistence defers, the chain walk still works).
    let checkpoint = Checkpoint {
        epoch: Epoch::new(1),
        root: roots[5],
    };
    let event = FinalityEvent {
        finalized: checkpoint,
        justified: checkpoint,
        previous_justified: checkpoint,
    };
    indexer.process_finality_event(&event).unwrap();

    indexer.shutdown();
}

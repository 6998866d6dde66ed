//! Pool bookkeeping under arbitrary acquire/release sequences

use std::time::Duration;

use proptest::prelude::*;
use waypoint_pool::{ConnectionPool, Error, PoolConfig, PooledConnection};
use waypoint_transport::Transport;
use waypoint_transport_memory::{MemoryNetwork, MemoryTransport};

const ADDRESSES: [&str; 2] = ["node-a", "node-b"];
const WAIT: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
enum Op {
    Acquire(usize),
    Release { index: usize, healthy: bool },
    Drop(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..ADDRESSES.len()).prop_map(Op::Acquire),
        (any::<usize>(), any::<bool>()).prop_map(|(index, healthy)| Op::Release { index, healthy }),
        any::<usize>().prop_map(Op::Drop),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn take(held: &mut Vec<PooledConnection>, index: usize) -> Option<PooledConnection> {
    if held.is_empty() {
        None
    } else {
        let index = index % held.len();
        Some(held.swap_remove(index))
    }
}

proptest! {
    #[test]
    fn in_use_never_exceeds_pool_size(size in 1usize..4, ops in prop::collection::vec(op(), 1..40)) {
        runtime().block_on(async move {
            let network = MemoryNetwork::new();
            let transport = MemoryTransport::new(network);
            let mut listeners = Vec::new();
            for address in ADDRESSES {
                listeners.push(transport.listen(address).await.unwrap());
            }

            let pool = ConnectionPool::new(transport, PoolConfig { size, ..PoolConfig::default() });
            let mut held: Vec<PooledConnection> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire(i) => {
                        let address = ADDRESSES[i];
                        let busy = held.iter().filter(|c| c.address() == address).count();
                        match pool.acquire(address, WAIT).await {
                            Ok(conn) => {
                                assert!(busy < size);
                                held.push(conn);
                            }
                            Err(Error::Exhausted { .. }) => assert_eq!(busy, size),
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    Op::Release { index, healthy } => {
                        if let Some(conn) = take(&mut held, index) {
                            conn.release(healthy);
                        }
                    }
                    Op::Drop(index) => {
                        drop(take(&mut held, index));
                    }
                }

                for address in ADDRESSES {
                    let busy = held.iter().filter(|c| c.address() == address).count();
                    assert_eq!(pool.in_use(address), busy);
                    assert!(pool.in_use(address) <= size);
                }
            }
        });
    }
}

#[tokio::test]
async fn test_cancelled_acquire_does_not_leak() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new(MemoryNetwork::new());
    let _listener = transport.listen("node-a").await.unwrap();
    let pool = ConnectionPool::new(
        transport,
        PoolConfig {
            size: 1,
            ..PoolConfig::default()
        },
    );

    let held = pool.acquire("node-a", WAIT).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire("node-a", Duration::from_secs(60)).await })
    };
    tokio::task::yield_now().await;
    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());

    held.release(true);
    assert_eq!(pool.in_use("node-a"), 0);

    let again = pool.acquire("node-a", WAIT).await.unwrap();
    assert!(again.reused());
    again.release(true);
}

// Bootstrap — gain initial connectivity into the routing overlay
//
// Every seed is dialed concurrently; the first successful connection wins.
// Losing attempts are abandoned rather than aborted: they keep running until
// their dial resolves and report into a channel sized so that they never
// block, even after nobody is listening any more.

use crate::locator::PeerLocation;
use crate::node::Connector;
use libp2p::PeerId;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Well-known rendezvous peers of the public IPFS DHT.
///
/// Can be replaced at build time by setting `P2PCAT_BOOTSTRAP_NODES` to a
/// comma-separated list of peer addresses.
pub const BOOTSTRAP_ADDRESSES: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/ipfs/QmSoLer265NRgSp2LA3dPaeykiS1J6DifTC88f5uVQKNAd",
    "/ip4/104.131.131.82/tcp/4001/ipfs/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ", // mars.i.ipfs.io
    "/ip4/104.236.179.241/tcp/4001/ipfs/QmSoLPppuBtQSGwKDZT2M73ULpjvfd3aZ6ha4oFGL1KrGM", // pluto.i.ipfs.io
    "/ip4/128.199.219.111/tcp/4001/ipfs/QmSoLSafTMBsPKadTEgaXctDQVcqN88CNLHXMkTNwMKPnu", // saturn.i.ipfs.io
    "/ip4/104.236.76.40/tcp/4001/ipfs/QmSoLV4Bbm51jM9C4gDYZQ9Cy3U6aXMJDAbzgu2fzaDs64", // venus.i.ipfs.io
    "/ip4/178.62.158.247/tcp/4001/ipfs/QmSoLer265NRgSp2LA3dPaeykiS1J6DifTC88f5uVQKNAd", // earth.i.ipfs.io
    "/ip6/2604:a880:1:20::203:d001/tcp/4001/ipfs/QmSoLPppuBtQSGwKDZT2M73ULpjvfd3aZ6ha4oFGL1KrGM", // pluto.i.ipfs.io
    "/ip6/2400:6180:0:d0::151:6001/tcp/4001/ipfs/QmSoLSafTMBsPKadTEgaXctDQVcqN88CNLHXMkTNwMKPnu", // saturn.i.ipfs.io
    "/ip6/2604:a880:800:10::4a:5001/tcp/4001/ipfs/QmSoLV4Bbm51jM9C4gDYZQ9Cy3U6aXMJDAbzgu2fzaDs64", // venus.i.ipfs.io
    "/ip6/2a03:b0c0:0:1010::23:1001/tcp/4001/ipfs/QmSoLer265NRgSp2LA3dPaeykiS1J6DifTC88f5uVQKNAd", // earth.i.ipfs.io
];

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to bootstrap: none of {attempts} seed peers was reachable")]
    Failed { attempts: usize },
    #[error("bootstrap cancelled")]
    Cancelled,
}

/// The process-wide seed list, parsed once.
pub fn seeds() -> &'static [PeerLocation] {
    static SEEDS: OnceLock<Vec<PeerLocation>> = OnceLock::new();
    SEEDS.get_or_init(|| match option_env!("P2PCAT_BOOTSTRAP_NODES") {
        Some(nodes) if !nodes.trim().is_empty() => {
            let overrides: Vec<&str> = nodes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            parse_seeds(&overrides)
        }
        _ => parse_seeds(BOOTSTRAP_ADDRESSES),
    })
}

/// Parse a compiled-in seed list.
///
/// # Panics
///
/// Panics on an unparseable entry. Seeds are fixed at build time, so a bad
/// one is a build defect and must not be skipped silently.
pub fn parse_seeds(addrs: &[&str]) -> Vec<PeerLocation> {
    addrs
        .iter()
        .map(|addr| match PeerLocation::parse(addr) {
            Ok(location) => location,
            Err(e) => panic!("invalid bootstrap address {:?}: {}", addr, e),
        })
        .collect()
}

/// Race connections to every seed and return the first peer that answered.
pub async fn bootstrap<C>(
    connector: Arc<C>,
    seeds: &[PeerLocation],
    cancel: &CancellationToken,
) -> Result<PeerId, BootstrapError>
where
    C: Connector + ?Sized,
{
    info!("bootstrapping");

    let (done_tx, mut done_rx) = mpsc::channel(seeds.len().max(1));
    for seed in seeds {
        let connector = connector.clone();
        let done_tx = done_tx.clone();
        let seed = seed.clone();
        tokio::spawn(async move {
            let peer_id = seed.peer_id;
            let outcome = connector.connect(seed).await;
            // The receiver may be gone already; nothing left to report to
            let _ = done_tx.send((peer_id, outcome)).await;
        });
    }
    drop(done_tx);

    for _ in 0..seeds.len() {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(BootstrapError::Cancelled),

            outcome = done_rx.recv() => match outcome {
                Some((peer_id, Ok(()))) => {
                    info!("bootstrapped via {}", peer_id);
                    return Ok(peer_id);
                }
                Some((peer_id, Err(e))) => {
                    info!("bootstrap error: {} ({})", e, peer_id);
                }
                // Every attempt task ended without reporting
                None => break,
            },
        }
    }

    Err(BootstrapError::Failed {
        attempts: seeds.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{MockConnector, NodeError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::Instant;

    fn seed_list(n: usize) -> Vec<PeerLocation> {
        (0..n)
            .map(|i| PeerLocation {
                peer_id: PeerId::random(),
                addrs: vec![format!("/ip4/10.0.0.{}/tcp/4001", i + 1).parse().unwrap()],
            })
            .collect()
    }

    fn unreachable(peer_id: PeerId) -> NodeError {
        NodeError::Dial {
            peer_id,
            reason: "connection refused".to_string(),
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        SucceedAfter(Duration),
        FailAfter(Duration),
        Hang,
    }

    struct ScriptedConnector {
        script: HashMap<PeerId, Behaviour>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, location: PeerLocation) -> Result<(), NodeError> {
            match self.script[&location.peer_id] {
                Behaviour::SucceedAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                Behaviour::FailAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Err(unreachable(location.peer_id))
                }
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn scripted(seeds: &[PeerLocation], behaviours: &[Behaviour]) -> Arc<ScriptedConnector> {
        Arc::new(ScriptedConnector {
            script: seeds
                .iter()
                .map(|s| s.peer_id)
                .zip(behaviours.iter().copied())
                .collect(),
        })
    }

    #[test]
    fn test_compiled_in_seeds_parse() {
        let seeds = parse_seeds(BOOTSTRAP_ADDRESSES);
        assert_eq!(seeds.len(), BOOTSTRAP_ADDRESSES.len());
        assert!(seeds.iter().all(|s| !s.addrs.is_empty()));
    }

    #[test]
    #[should_panic(expected = "invalid bootstrap address")]
    fn test_corrupt_seed_panics() {
        parse_seeds(&["/ip4/104.131.131.82/tcp/4001"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_wins_without_waiting_for_slow_failures() {
        let seeds = seed_list(3);
        let connector = scripted(
            &seeds,
            &[
                Behaviour::FailAfter(Duration::from_secs(30)),
                Behaviour::SucceedAfter(Duration::from_millis(200)),
                Behaviour::Hang,
            ],
        );

        let started = Instant::now();
        let winner = bootstrap(connector, &seeds, &CancellationToken::new())
            .await
            .expect("one seed is reachable");

        assert_eq!(winner, seeds[1].peer_id);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_before_success_are_tolerated() {
        let seeds = seed_list(3);
        let connector = scripted(
            &seeds,
            &[
                Behaviour::FailAfter(Duration::from_millis(10)),
                Behaviour::FailAfter(Duration::from_millis(20)),
                Behaviour::SucceedAfter(Duration::from_millis(500)),
            ],
        );

        let winner = bootstrap(connector, &seeds, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(winner, seeds[2].peer_id);
    }

    #[tokio::test]
    async fn test_all_unreachable_fails_after_every_outcome() {
        let seeds = seed_list(4);

        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(4)
            .returning(|location| Err(unreachable(location.peer_id)));

        let err = bootstrap(Arc::new(connector), &seeds, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Failed { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_single_reachable_seed_with_mock() {
        let seeds = seed_list(1);

        let mut connector = MockConnector::new();
        connector.expect_connect().times(1).returning(|_| Ok(()));

        let winner = bootstrap(Arc::new(connector), &seeds, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(winner, seeds[0].peer_id);
    }

    #[tokio::test]
    async fn test_empty_seed_list_fails() {
        let connector = Arc::new(MockConnector::new());
        let err = bootstrap(connector, &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Failed { attempts: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_any_outcome() {
        let seeds = seed_list(3);
        let connector = scripted(&seeds, &[Behaviour::Hang; 3]);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bootstrap(connector, &seeds, &cancel).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_returns_promptly() {
        let seeds = seed_list(2);
        let connector = scripted(
            &seeds,
            &[
                Behaviour::FailAfter(Duration::from_millis(50)),
                Behaviour::Hang,
            ],
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = bootstrap(connector, &seeds, &cancel).await.unwrap_err();

        assert!(matches!(err, BootstrapError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}

//! Server lifecycle under interleaved and concurrent route changes.

mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use edge_gateway::context::UpstreamClient;
use edge_gateway::router::{Manager, ServerSettings};

use common::{free_ports, null_route};

fn manager() -> Arc<Manager> {
    let settings = ServerSettings {
        host: "127.0.0.1".to_string(),
        drain_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    Arc::new(Manager::new(settings, Arc::new(UpstreamClient::new().unwrap())))
}

async fn assert_matches_model(manager: &Manager, model: &HashMap<u16, HashSet<String>>, ports: &[u16]) {
    assert!(manager.check_invariant().await);
    for port in ports {
        let expected = model.get(port).map_or(0, |ids| ids.len());
        assert_eq!(manager.route_count(*port).await, expected, "route count on {port}");
        assert_eq!(manager.has_server(*port).await, expected > 0, "server on {port}");
    }
}

#[tokio::test]
async fn randomized_add_del_keeps_server_iff_routes() {
    let manager = manager();
    let ports: [u16; 3] = free_ports();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: HashMap<u16, HashSet<String>> = HashMap::new();

    for _ in 0..60 {
        let port = ports[rng.gen_range(0..ports.len())];
        let id = format!("route-{}", rng.gen_range(0..4));

        if rng.gen_bool(0.55) {
            manager.add(port, null_route(&id)).await.unwrap();
            model.entry(port).or_default().insert(id);
        } else {
            manager.del(port, &id).await.unwrap();
            if let Some(ids) = model.get_mut(&port) {
                ids.remove(&id);
                if ids.is_empty() {
                    model.remove(&port);
                }
            }
        }

        assert_matches_model(&manager, &model, &ports).await;
    }

    manager.cancel().await;
    for port in ports {
        assert!(!manager.has_server(port).await);
    }
}

#[tokio::test]
async fn second_route_reuses_listener_and_readd_rebinds() {
    let manager = manager();
    let [port] = free_ports();

    manager.add(port, null_route("a")).await.unwrap();
    manager.add(port, null_route("b")).await.unwrap();
    assert_eq!(manager.ports().await.len(), 1);
    assert_eq!(manager.ports().await[0].routes.len(), 2);

    manager.del(port, "a").await.unwrap();
    manager.del(port, "b").await.unwrap();
    // Released before del returned.
    drop(std::net::TcpListener::bind(("127.0.0.1", port)).unwrap());

    manager.add(port, null_route("c")).await.unwrap();
    assert!(manager.has_server(port).await);
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_err());

    manager.cancel().await;
}

#[tokio::test]
async fn concurrent_changes_on_different_ports_finish() {
    let manager = manager();
    let ports: [u16; 4] = free_ports();

    let mut tasks = Vec::new();
    for (i, port) in ports.into_iter().enumerate() {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(i as u64);
            for step in 0..20 {
                let id = format!("r{}", rng.gen_range(0..3));
                if step % 3 == 2 {
                    manager.del(port, &id).await.unwrap();
                } else {
                    manager.add(port, null_route(&id)).await.unwrap();
                }
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(20), async {
        for task in tasks {
            task.await.unwrap();
        }
    })
    .await
    .expect("route changes stalled");

    assert!(manager.check_invariant().await);
    for status in manager.ports().await {
        assert!(!status.routes.is_empty());
    }
    manager.cancel().await;
}

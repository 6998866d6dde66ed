//! Selection against a live in-memory registry

use std::time::Duration;

use tokio::time::timeout;
use waypoint_bootable::Bootable;
use waypoint_registry::{Registry, ServiceInstance};
use waypoint_registry_memory::MemoryRegistry;
use waypoint_selector::{
    HealthConfig, RegistrySelector, SelectOptions, Selector, SelectorConfig, SelectorError,
    Strategy,
};

fn node(id: &str) -> ServiceInstance {
    ServiceInstance::new("greeter", format!("addr-{id}")).with_id(id)
}

fn greeter_registry() -> MemoryRegistry {
    MemoryRegistry::new().with_instances([
        node("a").with_version("1"),
        node("b").with_version("2"),
        node("c").with_version("2"),
    ])
}

async fn first_ids(selector: &impl Selector, options: &SelectOptions) -> Vec<String> {
    selector
        .select("greeter", options)
        .await
        .unwrap()
        .take(3)
        .map(|n| n.id().to_string())
        .collect()
}

#[tokio::test]
async fn test_unknown_service_is_not_found() {
    let selector = RegistrySelector::new(greeter_registry());

    let err = selector
        .select("ghost", &SelectOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err, SelectorError::NotFound("ghost".to_string()));
}

#[tokio::test]
async fn test_filters_removing_everything_is_none_available() {
    let selector = RegistrySelector::new(greeter_registry());

    let err = selector
        .select("greeter", &SelectOptions::new().version("9"))
        .await
        .unwrap_err();
    assert_eq!(err, SelectorError::NoneAvailable("greeter".to_string()));
}

#[tokio::test]
async fn test_version_filter_and_exclusion() {
    let selector = RegistrySelector::new(greeter_registry());

    let options = SelectOptions::new().version("2").exclude("addr-b");
    let mut generator = selector.select("greeter", &options).await.unwrap();
    assert_eq!(generator.len(), 1);
    assert_eq!(generator.next().unwrap().id(), "c");
}

#[tokio::test]
async fn test_round_robin_spreads_first_choice() {
    let selector = RegistrySelector::new(greeter_registry());
    let options = SelectOptions::new();

    let mut firsts = Vec::new();
    for _ in 0..3 {
        firsts.push(first_ids(&selector, &options).await[0].clone());
    }
    assert_eq!(firsts, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_least_failures_override_avoids_failing_node() {
    let selector = RegistrySelector::new(greeter_registry());
    selector.mark("greeter", &node("a"), Some(&std::fmt::Error));

    let options = SelectOptions::new().strategy(Strategy::LeastFailures);
    assert_eq!(first_ids(&selector, &options).await, vec!["b", "c", "a"]);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_nodes_skipped_until_probe() {
    let config = SelectorConfig {
        strategy: Strategy::RoundRobin,
        health: HealthConfig {
            probe_after: Duration::from_secs(10),
            ..HealthConfig::default()
        },
    };
    let registry = MemoryRegistry::new().with_instances([node("a")]);
    let selector = RegistrySelector::with_config(registry, config);

    for _ in 0..3 {
        selector.mark("greeter", &node("a"), Some(&std::fmt::Error));
    }

    let err = selector
        .select("greeter", &SelectOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err, SelectorError::NoneAvailable("greeter".to_string()));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(selector.select("greeter", &SelectOptions::new()).await.is_ok());

    // Only the first caller after the cool-down gets the node back.
    assert!(selector.select("greeter", &SelectOptions::new()).await.is_err());

    selector.mark("greeter", &node("a"), None);
    assert!(selector.select("greeter", &SelectOptions::new()).await.is_ok());
}

#[tokio::test]
async fn test_registry_change_resets_health() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = greeter_registry();
    let selector = RegistrySelector::new(registry.clone());
    selector.start().await.unwrap();

    selector.mark("greeter", &node("a"), Some(&std::fmt::Error));
    assert_eq!(selector.health("greeter").len(), 1);

    registry.register(node("d")).await.unwrap();

    timeout(Duration::from_secs(1), async {
        while !selector.health("greeter").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    selector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reset_twice_matches_fresh_selector() {
    let selector = RegistrySelector::new(greeter_registry());
    selector.mark("greeter", &node("a"), Some(&std::fmt::Error));
    selector.mark("greeter", &node("b"), None);

    selector.reset("greeter");
    selector.reset("greeter");

    let fresh = RegistrySelector::new(greeter_registry());
    assert_eq!(selector.health("greeter"), fresh.health("greeter"));

    let options = SelectOptions::new();
    assert_eq!(
        first_ids(&selector, &options).await,
        first_ids(&fresh, &options).await
    );
}

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use repliq::prelude::*;
use repliq::IndexPath;

// ---------------------------------------------------------------------------
// Counter object
// ---------------------------------------------------------------------------

const COUNT: usize = 0;
const STEP: usize = 1;

const MILESTONE: usize = 2; // after countChanged and stepChanged

const TICK: usize = 1; // after the derived pushStep
const RESET: usize = 2;

#[derive(Debug, Default)]
struct Counter {
    count: i64,
    step: i64,
}

impl Counter {
    fn api() -> Arc<CapabilityMap> {
        static API: OnceLock<Arc<CapabilityMap>> = OnceLock::new();
        API.get_or_init(|| {
            Arc::new(
                CapabilityMap::builder("Counter")
                    .property("count", ValueType::Int, PropertyModifier::ReadOnly)
                    .property("step", ValueType::Int, PropertyModifier::ReadPush)
                    .signal("milestone", [("count", ValueType::Int)])
                    .method("tick", Vec::<(String, ValueType)>::new(), ValueType::Int)
                    .method("reset", Vec::<(String, ValueType)>::new(), ValueType::Void)
                    .build(),
            )
        })
        .clone()
    }

    fn tick(&mut self, signals: &mut Emitter) -> i64 {
        self.count += self.step;
        if self.count % 10 == 0 {
            signals.emit(MILESTONE, [Value::Int(self.count)]);
        }
        self.count
    }
}

impl RemoteObject for Counter {
    fn capabilities(&self) -> Arc<CapabilityMap> {
        Self::api()
    }

    fn property(&self, index: usize) -> Value {
        match index {
            COUNT => Value::Int(self.count),
            STEP => Value::Int(self.step),
            _ => Value::Null,
        }
    }

    fn set_property(&mut self, index: usize, value: Value) -> Result<(), String> {
        match index {
            STEP => self.step = value.as_i64().ok_or("step must be an integer")?,
            _ => return Err(format!("property {index} is read-only")),
        }
        Ok(())
    }

    fn invoke(&mut self, method: usize, _args: Vec<Value>, signals: &mut Emitter) -> Result<Value, String> {
        match method {
            TICK => Ok(Value::Int(self.tick(signals))),
            RESET => {
                self.count = 0;
                Ok(Value::Null)
            }
            _ => Err(format!("unknown method {method}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Demo
// ---------------------------------------------------------------------------

fn fruit() -> StandardModel {
    let mut model = StandardModel::new(1).with_headers(["fruit"]);
    let rows = ["apple", "banana", "cherry", "damson"]
        .into_iter()
        .map(|name| vec![Value::from(name)])
        .collect();
    model.insert_rows(&IndexPath::root(), 0, rows);
    model
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    repliq::logging::init();

    // Registry host.
    let registry_node = Node::new();
    let registry_url = registry_node.listen("tcp://127.0.0.1:0").await?;
    let registry = registry_node.host_registry().await?;
    let mut announcements = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = announcements.recv().await {
            tracing::info!(?event, "registry");
        }
    });

    // Source node.
    let source_node = Node::builder().registry_url(registry_url.clone()).build();
    source_node.listen("tcp://127.0.0.1:0").await?;
    let counter = source_node
        .enable_remoting("counter", Counter { count: 0, step: 1 })
        .await?;
    let _fruit = source_node.enable_model_remoting("fruit", fruit()).await?;

    // Client node: finds both through the registry.
    let client_node = Node::builder().registry_url(registry_url).build();
    let replica = client_node.acquire("counter", Counter::api());
    let mut events = replica.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ReplicaEvent::Signal { index: MILESTONE, args } => tracing::info!(?args, "milestone"),
                other => tracing::debug!(?other, "replica event"),
            }
        }
    });

    let state = tokio::time::timeout(Duration::from_secs(5), replica.wait_for_source()).await?;
    tracing::info!(%state, count = ?replica.property(COUNT), "replica ready");

    replica.set_property(STEP, Value::Int(5))?;
    for _ in 0..4 {
        let count = replica.call(TICK, Vec::new()).wait().await?;
        tracing::info!(?count, "tick");
    }
    counter.update(|c, signals| c.tick(signals)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(count = ?replica.property(COUNT), "after local tick");

    let model = client_node.acquire_model("fruit", CacheConfig::from_env());
    tokio::time::timeout(Duration::from_secs(5), model.wait_ready()).await?;
    let rows = model.row_count(model.root());
    for row in 0..rows {
        model.fetch(row, 0, Role::DISPLAY);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for row in 0..rows {
        tracing::info!(row, value = ?model.fetch(row, 0, Role::DISPLAY), "fruit");
    }

    client_node.shutdown().await;
    source_node.shutdown().await;
    registry_node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_adds_step_and_signals_milestones() {
        let mut counter = Counter { count: 5, step: 5 };
        let mut signals = Emitter::new();
        assert_eq!(counter.tick(&mut signals), 10);
        assert!(!signals.is_empty());

        let mut quiet = Emitter::new();
        assert_eq!(counter.tick(&mut quiet), 15);
        assert!(quiet.is_empty());
    }

    #[test]
    fn test_only_step_is_writable() {
        let mut counter = Counter::default();
        assert!(counter.set_property(STEP, Value::Int(3)).is_ok());
        assert!(counter.set_property(COUNT, Value::Int(3)).is_err());
        assert_eq!(counter.property(STEP), Value::Int(3));
    }

    #[test]
    fn test_api_layout() {
        let api = Counter::api();
        assert_eq!(api.method_index("tick"), Some(TICK));
        assert_eq!(api.method_index("reset"), Some(RESET));
        assert_eq!(api.signal_index("milestone"), Some(MILESTONE));
    }

    #[tokio::test]
    async fn test_counter_replicates_between_nodes() {
        let host = Node::new();
        let url = host.listen("tcp://127.0.0.1:0").await.unwrap();
        let _handle = host.enable_remoting("counter", Counter { count: 0, step: 2 }).await.unwrap();

        let client = Node::new();
        client.connect_to_node(&url.to_string()).await.unwrap();
        let replica = client.acquire("counter", Counter::api());
        let state = tokio::time::timeout(Duration::from_secs(5), replica.wait_for_source())
            .await
            .unwrap();
        assert_eq!(state, ReplicaState::Valid);

        let count = replica.call(TICK, Vec::new()).wait().await.unwrap();
        assert_eq!(count, Value::Int(2));
    }
}

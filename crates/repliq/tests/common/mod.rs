//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use repliq::prelude::*;
use tokio::sync::broadcast;

/// Upper bound for every wait in the tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

/// Polls `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

/// Waits for the first event matching `pred`.
pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    within(async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
}

/// A node listening on a free loopback port, and the URL it listens on.
pub async fn listening_node() -> (Node, String) {
    let node = Node::new();
    let endpoint = node.listen("tcp://127.0.0.1:0").await.expect("should listen");
    (node, endpoint.to_string())
}

// Property indices.
pub const COUNT: usize = 0;
pub const LABEL: usize = 1;
pub const ID: usize = 2;

// Signal indices: 0 and 1 are the count and label notifications.
pub const OVERFLOWED: usize = 2;

// Method indices: 0 is the derived pushCount.
pub const INCREMENT: usize = 1;
pub const DIVIDE: usize = 2;
pub const RESET: usize = 3;

/// A counter with one property of each writable kind.
#[derive(Debug, Default)]
pub struct Counter {
    pub count: i64,
    pub label: String,
    pub id: u64,
}

impl Counter {
    pub fn new(count: i64) -> Self {
        Self {
            count,
            label: "counter".into(),
            id: 7,
        }
    }

    pub fn api() -> Arc<CapabilityMap> {
        static API: OnceLock<Arc<CapabilityMap>> = OnceLock::new();
        API.get_or_init(|| {
            Arc::new(
                CapabilityMap::builder("Counter")
                    .property("count", ValueType::Int, PropertyModifier::ReadPush)
                    .property("label", ValueType::String, PropertyModifier::ReadWrite)
                    .property("id", ValueType::UInt, PropertyModifier::Constant)
                    .signal("overflowed", [("at", ValueType::Int)])
                    .method("increment", [("by", ValueType::Int)], ValueType::Int)
                    .method("divide", [("by", ValueType::Int)], ValueType::Int)
                    .method("reset", Vec::<(String, ValueType)>::new(), ValueType::Void)
                    .build(),
            )
        })
        .clone()
    }

    /// Same type name, different layout.
    pub fn other_api() -> Arc<CapabilityMap> {
        Arc::new(
            CapabilityMap::builder("Counter")
                .property("count", ValueType::Double, PropertyModifier::ReadOnly)
                .build(),
        )
    }
}

impl RemoteObject for Counter {
    fn capabilities(&self) -> Arc<CapabilityMap> {
        Self::api()
    }

    fn property(&self, index: usize) -> Value {
        match index {
            COUNT => Value::Int(self.count),
            LABEL => Value::from(self.label.as_str()),
            ID => Value::UInt(self.id),
            _ => Value::Null,
        }
    }

    fn set_property(&mut self, index: usize, value: Value) -> Result<(), String> {
        match index {
            COUNT => self.count = value.as_i64().ok_or("count must be an integer")?,
            LABEL => self.label = value.as_str().ok_or("label must be a string")?.to_string(),
            _ => return Err(format!("property {index} is read-only")),
        }
        Ok(())
    }

    fn invoke(&mut self, method: usize, args: Vec<Value>, signals: &mut Emitter) -> Result<Value, String> {
        let arg = || args.first().and_then(Value::as_i64).unwrap_or_default();
        match method {
            INCREMENT => {
                self.count += arg();
                if self.count > 100 {
                    signals.emit(OVERFLOWED, [Value::Int(self.count)]);
                }
                Ok(Value::Int(self.count))
            }
            DIVIDE => match arg() {
                0 => Err("division by zero".into()),
                by => {
                    self.count /= by;
                    Ok(Value::Int(self.count))
                }
            },
            RESET => {
                self.count = 0;
                Ok(Value::Null)
            }
            _ => Err(format!("unknown method {method}")),
        }
    }
}

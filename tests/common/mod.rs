//! Shared helpers for integration tests: a scripted in-process transport.

#![allow(dead_code)]

use async_trait::async_trait;
use fleetstate::clock::ManualClock;
use fleetstate::cluster::{Node, NodeInfo};
use fleetstate::codec::BinaryBundleCodec;
use fleetstate::communicator::{CommunicatorConfig, RpcCommunicator};
use fleetstate::rpc::{ErrorCode, Request, RpcError, RpcResult, RpcTarget, RpcTransport};
use fleetstate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Decides the reply for a call; `None` leaves the call hanging until its
/// timeout.
pub type Script = dyn Fn(&str, &Request) -> Option<RpcResult> + Send + Sync;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub address: String,
    pub request: Request,
    pub timeout: Duration,
}

pub struct ScriptedTransport {
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    refused: Mutex<HashSet<String>>,
    connects: Mutex<usize>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&str, &Request) -> Option<RpcResult> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
            refused: Mutex::new(HashSet::new()),
            connects: Mutex::new(0),
        })
    }

    /// Transport answering every call with an empty success.
    pub fn accepting() -> Arc<Self> {
        Self::new(|_, _| Some(Ok(Vec::new())))
    }

    pub fn refuse(&self, address: &str) {
        self.refused.lock().insert(address.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| c.request.method.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.lock()
    }
}

impl RpcTransport for ScriptedTransport {
    fn connect(&self, address: &str) -> Result<Arc<dyn RpcTarget>> {
        if self.refused.lock().contains(address) {
            return Err(Error::Connection {
                address: address.to_string(),
                reason: "refused by test".to_string(),
            });
        }
        *self.connects.lock() += 1;
        Ok(Arc::new(ScriptedTarget {
            address: address.to_string(),
            script: self.script.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct ScriptedTarget {
    address: String,
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

#[async_trait]
impl RpcTarget for ScriptedTarget {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_valid(&self) -> bool {
        true
    }

    async fn invoke(&self, request: Request, timeout: Duration) -> RpcResult {
        self.calls.lock().push(RecordedCall {
            address: self.address.clone(),
            request: request.clone(),
            timeout,
        });
        match (self.script)(&self.address, &request) {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout).await;
                Err(RpcError::new(ErrorCode::Timeout, "scripted timeout"))
            }
        }
    }
}

pub fn no_such_method() -> RpcResult {
    Err(RpcError::new(ErrorCode::NoSuchMethod, "no such method"))
}

pub fn communicator(transport: Arc<ScriptedTransport>) -> RpcCommunicator {
    communicator_with(transport, CommunicatorConfig::default())
}

pub fn communicator_with(
    transport: Arc<ScriptedTransport>,
    config: CommunicatorConfig,
) -> RpcCommunicator {
    RpcCommunicator::new(
        tokio::runtime::Handle::current(),
        transport,
        Arc::new(ManualClock::new(1_000)),
        BinaryBundleCodec::default(),
        config,
    )
    .unwrap()
    .with_seed(42)
}

pub fn live_node(node: Node, address: &str) -> NodeInfo {
    let mut info = NodeInfo::new(node);
    info.set_rpc_address(address);
    info.mark_live();
    info
}

pub fn address_of(node: Node) -> String {
    format!("tcp/{}-{}:19090", node.node_type, node.index)
}

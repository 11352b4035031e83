//! Fire-and-forget RPCs from the coordinator to fleet nodes
//!
//! Three operations are supported: polling a node for its state, pushing a
//! cluster state bundle, and activating a pushed version. Each call takes
//! the node's bookkeeping by `&mut`, spawns the RPC onto the runtime and
//! returns immediately. The outcome is delivered through a [`Waiter`],
//! normally an unbounded channel drained by the coordination loop.

pub mod jitter;
pub mod protocol;
pub mod request;
pub mod waiter;

pub use jitter::jittered_timeout;
pub use protocol::{
    RpcVersion, ACTIVATE_VERSION_METHOD, GET_NODE_STATE_METHOD, SET_DISTRIBUTION_STATES_METHOD,
    SET_SYSTEM_STATE_2_METHOD, SET_SYSTEM_STATE_METHOD,
};
pub use request::{
    ActivateVersionReply, GetNodeStateReply, NodeReply, NodeStateReport, PendingRequest,
    RequestError, SetClusterStateReply,
};
pub use waiter::{FnWaiter, Waiter};

use crate::clock::Clock;
use crate::cluster::NodeInfo;
use crate::codec::{BinaryBundleCodec, ClusterStateBundleCodec};
use crate::rpc::{ErrorCode, Request, RpcError, RpcTarget, RpcTransport, Value};
use crate::state::ClusterStateBundle;
use crate::{Error, Result};
use metrics::counter;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Communicator configuration
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Index of this coordinator, sent with every poll
    pub coordinator_index: u16,
    /// Upper bound for the poll timeout handed to nodes
    pub max_node_state_timeout: Duration,
    /// Lower end of the jitter range, percent of the max timeout
    pub jitter_start_percent: u8,
    /// Upper end of the jitter range, percent of the max timeout
    pub jitter_stop_percent: u8,
    /// Added to the poll timeout for the client-side wait
    pub round_trip_allowance: Duration,
    pub set_state_timeout: Duration,
    pub activate_timeout: Duration,
}

impl CommunicatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.jitter_start_percent > self.jitter_stop_percent {
            return Err(Error::Config(format!(
                "jitter start percent {} exceeds stop percent {}",
                self.jitter_start_percent, self.jitter_stop_percent
            )));
        }
        if self.jitter_stop_percent > 100 {
            return Err(Error::Config(format!(
                "jitter stop percent must be at most 100, got {}",
                self.jitter_stop_percent
            )));
        }
        let max_ms = self.max_node_state_timeout.as_millis();
        if max_ms > i32::MAX as u128 {
            return Err(Error::Config(format!(
                "node state timeout of {}ms does not fit the wire format",
                max_ms
            )));
        }
        Ok(())
    }
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            coordinator_index: 0,
            max_node_state_timeout: Duration::from_secs(60),
            jitter_start_percent: 80,
            jitter_stop_percent: 100,
            round_trip_allowance: Duration::from_secs(5),
            set_state_timeout: Duration::from_secs(60),
            activate_timeout: Duration::from_secs(60),
        }
    }
}

/// Node-facing operations of the coordinator.
///
/// Every method fails synchronously, without ever invoking the waiter, when
/// the request cannot be dispatched. Once dispatched the waiter is invoked
/// exactly once.
pub trait Communicator: Send + Sync {
    fn get_node_state(
        &self,
        node: &mut NodeInfo,
        waiter: Box<dyn Waiter<GetNodeStateReply>>,
    ) -> Result<()>;

    fn set_cluster_state_bundle(
        &self,
        node: &mut NodeInfo,
        bundle: Arc<ClusterStateBundle>,
        waiter: Box<dyn Waiter<SetClusterStateReply>>,
    ) -> Result<()>;

    fn activate_cluster_state_version(
        &self,
        node: &mut NodeInfo,
        version: u32,
        waiter: Box<dyn Waiter<ActivateVersionReply>>,
    ) -> Result<()>;
}

/// [`Communicator`] issuing calls over an [`RpcTransport`].
pub struct RpcCommunicator {
    runtime: Handle,
    transport: Arc<dyn RpcTransport>,
    clock: Arc<dyn Clock>,
    codec: BinaryBundleCodec,
    config: CommunicatorConfig,
    rng: Mutex<StdRng>,
}

impl RpcCommunicator {
    pub fn new(
        runtime: Handle,
        transport: Arc<dyn RpcTransport>,
        clock: Arc<dyn Clock>,
        codec: BinaryBundleCodec,
        config: CommunicatorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runtime,
            transport,
            clock,
            codec,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Seed the jitter generator, for reproducible tests.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    /// Timeout for the next poll, jittered within the configured range.
    pub fn next_poll_timeout(&self) -> Duration {
        jittered_timeout(
            &mut *self.rng.lock(),
            self.config.max_node_state_timeout,
            self.config.jitter_start_percent,
            self.config.jitter_stop_percent,
        )
    }

    fn connect(&self, node: &mut NodeInfo, method: &'static str) -> Result<Arc<dyn RpcTarget>> {
        let id = node.node();
        let address = match node.rpc_address() {
            Some(address) => address.to_string(),
            None => {
                warn!(node = %id, method, "Abandoning request to node without an RPC address");
                counter!("fleetstate_rpc_abandoned_total", "method" => method).increment(1);
                return Err(Error::Connection {
                    address: String::new(),
                    reason: format!("{} has no RPC address", id),
                });
            }
        };
        match node.connection_mut().ensure(self.transport.as_ref(), &address) {
            Ok(target) => Ok(target),
            Err(e) => {
                warn!(node = %id, address = %address, method, error = %e, "Abandoning request, connection could not be created");
                counter!("fleetstate_rpc_abandoned_total", "method" => method).increment(1);
                Err(e)
            }
        }
    }
}

fn record_outcome(method: &'static str, error: Option<&RequestError>) {
    let result = error.map(RequestError::kind).unwrap_or("ok");
    counter!(
        "fleetstate_rpc_requests_total",
        "method" => method,
        "result" => result,
        "run_id" => crate::telemetry::run_id()
    )
    .increment(1);
}

impl Communicator for RpcCommunicator {
    fn get_node_state(
        &self,
        node: &mut NodeInfo,
        waiter: Box<dyn Waiter<GetNodeStateReply>>,
    ) -> Result<()> {
        let target = self.connect(node, GET_NODE_STATE_METHOD)?;
        let timeout = self.next_poll_timeout();
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let sent_state = node.poll_state_summary().to_string();
        let request = Request::new(GET_NODE_STATE_METHOD)
            .with_param(Value::String(sent_state.clone()))
            .with_param(Value::Int32(timeout_ms))
            .with_param(Value::Int32(i32::from(self.config.coordinator_index)));
        let wait = timeout + self.config.round_trip_allowance;
        let cancel = node.connection_mut().begin_poll();
        let pending = PendingRequest::new(node.node(), request.clone(), self.clock.now_millis(), waiter);

        debug!(node = %pending.node, state = %sent_state, timeout_ms, "Polling node state");
        self.runtime.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(RpcError::new(ErrorCode::Abort, "node state poll aborted")),
                outcome = target.invoke(request, wait) => outcome,
            };
            let result = outcome
                .map_err(|e| RequestError::from_rpc(e, false))
                .and_then(|values| NodeStateReport::from_values(&values));
            if let Err(e) = &result {
                debug!(node = %pending.node, error = %e, "Node state poll failed");
            }
            record_outcome(GET_NODE_STATE_METHOD, result.as_ref().err());
            let node = pending.node;
            pending.complete(GetNodeStateReply {
                node,
                sent_state,
                timeout_ms,
                result,
            });
        });
        Ok(())
    }

    fn set_cluster_state_bundle(
        &self,
        node: &mut NodeInfo,
        bundle: Arc<ClusterStateBundle>,
        waiter: Box<dyn Waiter<SetClusterStateReply>>,
    ) -> Result<()> {
        if node.is_protocol_exhausted() {
            return Err(Error::ProtocolExhausted {
                node: node.node().to_string(),
            });
        }
        let rpc_version = node.rpc_version();
        let method = rpc_version.set_state_method();
        let request = if rpc_version.sends_bundle() {
            let encoded = self.codec.encode(&bundle)?;
            Request::new(method)
                .with_param(Value::Int8(encoded.compression_type.code()))
                .with_param(Value::Int32(encoded.uncompressed_length))
                .with_param(Value::Data(encoded.payload))
        } else {
            Request::new(method).with_param(Value::String(bundle.baseline().to_string()))
        };
        let target = self.connect(node, method)?;
        let timeout = self.config.set_state_timeout;
        let pending = PendingRequest::new(node.node(), request.clone(), self.clock.now_millis(), waiter);

        debug!(node = %pending.node, version = bundle.version(), protocol = %rpc_version, "Sending cluster state bundle");
        self.runtime.spawn(async move {
            let result = target
                .invoke(request, timeout)
                .await
                .map(|_| ())
                .map_err(|e| RequestError::from_rpc(e, true));
            record_outcome(method, result.as_ref().err());
            let node = pending.node;
            pending.complete(SetClusterStateReply {
                node,
                bundle,
                rpc_version,
                result,
            });
        });
        Ok(())
    }

    fn activate_cluster_state_version(
        &self,
        node: &mut NodeInfo,
        version: u32,
        waiter: Box<dyn Waiter<ActivateVersionReply>>,
    ) -> Result<()> {
        let wire_version = i32::try_from(version).map_err(|_| {
            Error::Internal(format!("cluster state version {} exceeds i32", version))
        })?;
        let target = self.connect(node, ACTIVATE_VERSION_METHOD)?;
        let request = Request::new(ACTIVATE_VERSION_METHOD).with_param(Value::Int32(wire_version));
        let timeout = self.config.activate_timeout;
        let pending = PendingRequest::new(node.node(), request.clone(), self.clock.now_millis(), waiter);

        debug!(node = %pending.node, version, "Activating cluster state version");
        self.runtime.spawn(async move {
            let result = target
                .invoke(request, timeout)
                .await
                .map_err(|e| RequestError::from_rpc(e, true))
                .and_then(|values| match values.first().and_then(Value::as_i32) {
                    Some(activated) if activated >= 0 => Ok(activated as u32),
                    _ => Err(RequestError::BadReply(format!(
                        "activation reply {:?} does not carry a version",
                        values
                    ))),
                });
            record_outcome(ACTIVATE_VERSION_METHOD, result.as_ref().err());
            let node = pending.node;
            pending.complete(ActivateVersionReply {
                node,
                version,
                result,
            });
        });
        Ok(())
    }
}

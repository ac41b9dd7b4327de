// 外部协作方：远端自动化代理、CRM 转发出口与后台外呼任务。
mod client;
mod outward;
mod sink;

pub use client::{AgentClient, HttpAgentClient};
pub use outward::OutwardCalls;
pub use sink::{ForwardEvent, ForwardSink, HttpForwardSink, NoopForwardSink};

use std::fmt;

/// 远端代理主机上的一个客户端槽位。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentTarget {
    pub host_id: String,
    pub client_id: i64,
}

impl AgentTarget {
    pub fn new(host_id: impl Into<String>, client_id: i64) -> Self {
        Self {
            host_id: host_id.into(),
            client_id,
        }
    }

    pub fn has_client(&self) -> bool {
        self.client_id > 0
    }
}

impl fmt::Display for AgentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.host_id, self.client_id)
    }
}

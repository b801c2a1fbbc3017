//! LDM-7 session engine.
//!
//! The paired upstream/downstream state machines that subscribe a receiver
//! to a feed, multicast products over a pluggable FMTP-style transport,
//! repair losses by unicast back-request, recover restarts with a
//! time-bounded backlog, and persist per-session memory so a restarted
//! receiver resumes cleanly.

pub mod acl;
pub mod config;
pub mod error;
pub mod exec;
pub mod fmtp;
pub mod queues;
pub mod receiver;
pub mod sender;
pub mod session_mem;
pub mod supervisor;
pub mod wire;

// Re-export main types
pub use acl::Acl;
pub use config::{BackstopTest, DownstreamConfig, UpstreamConfig, DEFAULT_PORT};
pub use error::{Ldm7Error, Result};
pub use exec::{Completion, Executor, HaltFlag, TaskFuture};
pub use fmtp::{
    ChannelReceiver, ChannelTransport, McastEvent, McastReceiver, McastSender, UdpReceiver,
    UdpSender,
};
pub use queues::IndexQueue;
pub use receiver::{DownstreamLdm7, DownstreamStats, McastJoiner, UdpJoiner};
pub use sender::{open_sender_queue, UpstreamLdm7};
pub use session_mem::SessionMemory;
pub use supervisor::Supervisor;
pub use wire::{BacklogSpec, McastInfo, Message, VcEndPoint};

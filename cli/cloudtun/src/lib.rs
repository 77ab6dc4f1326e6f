//! cloudtun library.
//!
//! Local tunnel manager: port-forwards to cluster pods and proxy
//! connections to managed SQL instances, without juggling subprocesses,
//! free ports, and credentials by hand.
//!
//! ## Architecture
//!
//! - **Session Registry** (`session`): the stateful heart; active
//!   sessions keyed by invocation record, one session per local port
//! - **Tunnel Process Supervisor** (`spawn`): spawns and owns the
//!   external tunnel processes, kill/wait handles
//! - **Event Notifier** (`notify`): lossy "something changed" hints for
//!   observers such as the web console
//! - **Inventory** (`inventory`): opaque gcloud/kubectl lookups for
//!   building invocations
//! - **SQL relay** (`sqlproxy`): listener-per-discovered-instance over
//!   the reconciler in `cloudtun-reconcile`
//!
//! The port oracle lives in `cloudtun-portcheck` and the invocation
//! record type in `cloudtun-invocation`.

pub mod commands;
pub mod config;
pub mod console;
pub mod history;
pub mod inventory;
pub mod notify;
pub mod session;
pub mod spawn;
pub mod sqlproxy;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use notify::{Event, EventNotifier, EventStream};
pub use session::{PortStatus, SessionRegistry};
pub use spawn::{ExecSpawner, MockSpawner, Session, Spawner};

//! Event acquisition and dispatch pipeline.
//!
//! # Architecture
//!
//! ```text
//! Rule ─> NativeWatcher / PollingWatcher
//!           │ raw ChangeEvents (bounded)
//!           v
//!         Debouncer ─> BatchCollector ─> Dispatcher (CPU-sized pool)
//!                                          │
//!                         CheckFile ─> Transform ─> HandlerChain
//!                                          │
//!                                      SeenState (after full success)
//! ```

mod batch;
mod debouncer;
mod dispatcher;
mod error;
mod event;
mod handler;
pub mod handlers;
mod hook;
mod native;
mod polling;
pub mod record;
mod rule;
mod runtime;
mod seen_state;

pub use batch::{BatchCollector, dedupe_batch, run_batch_collector};
pub use debouncer::{Debouncer, run_debouncer};
pub use dispatcher::{Dispatcher, Outcome};
pub use error::{HandlerError, HookError, StateError, WatchError};
pub use event::{ChangeEvent, Operation};
pub use handler::{Handler, HandlerChain};
pub use hook::{
    AutoCheck, AutoInit, CheckFile, Handle404Error, Hook, HookContext, HookRegistry, Mount,
    Plugin, Registrar, Transform,
};
pub use native::{GuardAction, LivenessGuard, LivenessState, NativeWatcher};
pub use polling::PollingWatcher;
pub use record::FileRecord;
pub use rule::{Rule, WatchStrategy, slash_path};
pub use runtime::{Pipeline, Watchdog};
pub use seen_state::{SeenEntry, SeenState};

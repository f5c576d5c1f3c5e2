//! Controller runtime: work queues, informers and the worker pool
//!
//! Controllers never talk to each other. Each owns a [`WorkQueue`] fed by
//! [`EnqueueHandler`]s registered on shared [`Informer`]s, and a
//! [`Controller`] that drains the queue into its [`Reconciler`].

mod controller;
mod informer;
pub mod leader;
mod queue;

pub use controller::{Action, Controller, Reconciler};
pub use informer::{
    owner_keys, Cache, DeletedObject, EnqueueHandler, EventHandler, Informer, InformerFactory,
    SharedInformer, DEFAULT_RESYNC_PERIOD,
};
pub use leader::LeaderElector;
pub use queue::{backoff_delay, WorkQueue};

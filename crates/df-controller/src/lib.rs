//! Dragonflow local controller.
//!
//! Receives lifecycle events from the northbound store and turns them into
//! forwarding pipeline rules:
//!
//! ```text
//! [store] --watch--> [WatchLoop] --callbacks--> [Controller]
//!                                                   |
//!                                            [EventDispatcher]
//!                                                   |
//!                                     [DfApp] --FlowMod--> [Datapath]
//! ```
//!
//! # Key Components
//!
//! - [`controller::Controller`]: store callback sink, owns the apps
//! - [`dispatcher::EventDispatcher`]: (kind, event) subscription table
//! - [`mpls::MplsApp`]: label switched route compiler
//! - [`retry::RetryCache`]: routes waiting on ports and switches

pub mod app;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod mpls;
pub mod port_resolver;
pub mod retry;

pub use app::{DfApp, MutationRetry};
pub use config::{ControllerConfig, MplsSettings, RetryPolicy, UpdatePolicySetting};
pub use controller::Controller;
pub use dispatcher::{EventDispatcher, EventHandler, NbEvent, Payload};
pub use error::{
    ConfigError, ControllerError, DispatchError, HandlerError, HandlerFailure, Result,
};
pub use mpls::{MplsApp, RouteRef};
pub use port_resolver::{PortResolver, StaticPortResolver};
pub use retry::{Constraint, RetryCache};

//! Policy resolution, evaluation and event distribution for the admission
//! gateway. See SPEC_FULL.md §4.3–§4.5.

#![deny(missing_docs)]

mod bus;
mod decision;
mod engine;
mod error;
mod event;
mod key;
mod resolver;
mod webhook;

pub use bus::{EventBus, HandlerError, HandlerId};
pub use decision::{Decision, DecisionAction, DecisionDetails};
pub use engine::{CheckContext, PolicyEngine};
pub use error::PolicyError;
pub use event::{Event, EventType};
pub use key::{counter_key, normalize_endpoint, sanitize_user_key};
pub use resolver::PolicyResolver;
pub use webhook::WebhookSink;

//! The engine's propagating error, per SPEC_FULL.md §7.

use store::StoreError;

/// The only error [`crate::PolicyEngine::check`] can return: a counter-store
/// failure that reached the engine despite [`store::CircuitBreaker`]'s
/// fail-open/fail-closed handling, meaning the configured backend is
/// unavailable under `onError = fail-closed`.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct PolicyError(#[from] pub StoreError);

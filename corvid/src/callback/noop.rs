//! No-op implementation of [`RunHooks`].

use async_trait::async_trait;

use super::hooks::RunHooks;

/// A [`RunHooks`] implementation that does nothing.
///
/// Used when a run is started without hooks. All methods are inherited
/// from the trait defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunHooks;

#[async_trait]
impl RunHooks for NoopRunHooks {}

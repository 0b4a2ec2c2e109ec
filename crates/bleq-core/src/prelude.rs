/*!
 * Prelude module with commonly used types.
 *
 * Importing `bleq_core::prelude::*` brings the types most callers need
 * into scope.
 */

pub use crate::config::{Config, ConfigBuilder, SharedConfig};
pub use crate::error::{Error, Result};
pub use crate::taskqueue::{Completion, Task, TaskExecutor};
pub use crate::types::{CharacteristicId, DescriptorId, OperationKind, PeripheralId, ServiceId};

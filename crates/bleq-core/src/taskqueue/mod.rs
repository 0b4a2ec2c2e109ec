/*!
 * Sequential task queue for bleq.
 *
 * Peripheral operations resolve through driver callbacks rather than
 * return values. This module adapts them into units of work that run
 * strictly one at a time: a [`Task`] issues its asynchronous request in
 * `start` and the executor's single worker suspends on a [`Completion`]
 * latch until the result path signals it.
 */

mod executor;
mod task;

pub use executor::TaskExecutor;
pub use task::{BoxedTask, Completion, Task};

/*!
Task dispatcher module.

Directory Layout:
  src/cmd/
    mod.rs       (this file: module declarations + re-exports)
    http.rs      (HttpArgs + execute_http)
    amqp.rs      (AmqpArgs + execute_amqp + ReplyBroker seam)
    format.rs    (response body / status / header formatting)
    shared.rs    (option validation, payload resolution, header parsing)

Conventions:
  - Each task module exposes exactly one public `execute_*` function that
    returns `anyhow::Result<()>`.
  - Argument structs derive `clap::Args` and are kept minimal.
  - Helpers shared by more than one task live in `shared.rs`.
*/

pub mod amqp;
pub mod format;
pub mod http;
pub mod shared;

pub use amqp::{AmqpArgs, execute_amqp};
pub use http::{HttpArgs, execute_http};

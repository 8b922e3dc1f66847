//! Session orchestration: the Planner/Worker conversation loop, role
//! implementations, code verification, and session bootstrap.

mod bootstrap;
mod code_interpreter;
mod error;
mod executor;
mod llm;
mod planner;
mod role;
mod session;
mod verification;

pub use bootstrap::build_session;
pub use code_interpreter::CodeInterpreter;
pub use error::{RoleError, SessionError};
pub use executor::CodeExecutor;
pub use llm::{ChatMessage, LanguageModel};
pub use planner::Planner;
pub use role::{Role, RoleContext};
pub use session::{Session, SessionBuilder};
pub use verification::CodeVerifier;

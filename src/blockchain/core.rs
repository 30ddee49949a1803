// Chain data model, ledger roots and block application.
pub mod chain;
pub mod state;
pub mod validation;
pub mod validator;

pub use chain::*;
pub use state::*;
pub use validation::*;
pub use validator::*;

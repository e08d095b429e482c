//! External collaborator traits and in-memory implementations.

pub mod auth;
pub mod cart;
pub mod proof;
pub mod provider;

pub use auth::{AuthService, Caller, InMemoryAuthService, Role};
pub use cart::{CartService, InMemoryCartService};
pub use proof::{InMemoryProofStore, ProofStore, ProofUpload, proof_filename};
pub use provider::{CheckoutProvider, InMemoryCheckoutProvider, StripeClient};

//! # Verdant Payments Crate
//!
//! One payment interface, two implementations.
//!
//! ## Modules
//! - `provider`: [`PaymentProvider`] trait + authorization/receipt types
//! - `native`: balance-checked native-token provider (no holds exist)
//! - `stripe`: fiat provider over manual-capture payment intents
//! - `gateway`: HTTP client for the card gateway (intents, customers,
//!   subscriptions, invoices)
//! - `webhook`: gateway webhook signature verification + checkout events
//! - `mock`: scripted provider for orchestration tests
//!
//! ## Hold Discipline
//!
//! `authorize` must either reserve funds (fiat) or prove they exist
//! (native). `capture` settles, `refund` releases. The retirement service
//! depends on `refund` being safe to call exactly once on any
//! authorization that was never captured.

pub mod gateway;
pub mod mock;
pub mod native;
pub mod provider;
pub mod stripe;
pub mod webhook;

pub use gateway::{
    Customer, GatewayError, Invoice, InvoiceGateway, InvoicePage, StripeClient, Subscription,
};
pub use mock::MockPaymentProvider;
pub use native::NativeTokenProvider;
pub use provider::{Authorization, AuthorizationStatus, PaymentError, PaymentProvider, PaymentReceipt};
pub use stripe::StripeProvider;
pub use webhook::{parse_checkout_event, verify_signature, CheckoutCompleted, WebhookError};

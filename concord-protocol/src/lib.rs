//! Concord Protocol - The peer-facing notarization driver.
//!
//! Ties the notarization state machine to its collaborators: the host
//! chain (behind the `main` and `mempool` locks), the wallet's key store,
//! and the peer system's `getbestproofroot` RPC endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        PROTOCOL DRIVER                           │
//! │                                                                  │
//! │  earned      - block producer attests to the peer chain          │
//! │  accept      - peer's earned notarization ingested here          │
//! │  confirm     - notaries sign and finalize eligible records       │
//! │                                                                  │
//! │        │ ChainView / MempoolView │         │ NotaryPeer │        │
//! │        ▼  (main, then mempool)   ▼         ▼  (no locks) ▼       │
//! │  ┌────────────────────────────┐    ┌──────────────────────────┐  │
//! │  │ active chain, address idx, │    │ getbestproofroot         │  │
//! │  │ mempool                    │    │ (JSON-RPC over HTTP)     │  │
//! │  └────────────────────────────┘    └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The only suspension points are peer RPC calls, made with both locks
//! released; every driver re-checks the tip height afterwards and fails
//! `stale-block` if it moved.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod accept;
pub mod builder;
pub mod chain;
pub mod config;
pub mod confirm;
pub mod earned;
pub mod errors;
pub mod peer;

pub use accept::{create_accepted_notarization, AcceptedNotarization};
pub use builder::TransactionBuilder;
pub use chain::{
    get_last_notarization, get_last_unspent_notarization, get_notarization_data,
    get_unspent_notary_evidence, ChainGuards, ChainView, HostChain, IndexEntry, MempoolView,
    MockChain, MockMempool,
};
pub use config::ProtocolConfig;
pub use confirm::{confirm_or_reject_notarizations, ConfirmationResult};
pub use earned::{create_earned_notarization, EarnedNotarization};
pub use errors::{ProtocolError, Result};
pub use peer::{
    BestProofRootRequest, BestProofRootResponse, HttpNotaryPeer, MockNotaryPeer, NotaryPeer,
};

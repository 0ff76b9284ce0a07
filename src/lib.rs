//! Promo code validation against a quorum of independent code sources
//!
//! A code is valid when its normalized form appears in at least the quorum threshold of
//! sources. Answers come from one of two interchangeable backends, see [`index`].

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod aggregate;
pub mod code;
pub mod config;
pub mod import;
pub mod index;
pub mod metrics;
pub mod refresh;
pub mod source;
pub mod validator;

#[cfg(test)]
mod test_utils;

pub use self::{
    code::{Code, Normalizer},
    config::{Backend, Config},
    index::PromoIndex,
    validator::Validator,
};

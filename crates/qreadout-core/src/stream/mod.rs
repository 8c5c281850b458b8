//! Stream identity and correlation-set generation
//!
//! - Channel-address triples, stream IDs and type classification ([`identity`])
//! - n-choose-r stream combinations for N-body correlators ([`combinations`])

pub mod combinations;
pub mod identity;

//! Runtime wiring: the transmit (anode) and receive (cathode) halves
//! and the priority lanes between polling and the serial links.

pub mod anode;
pub mod cathode;
pub mod lanes;

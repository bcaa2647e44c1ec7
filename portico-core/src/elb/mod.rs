//! Cloud load balancer registration API
//!
//! Classic ELB and application load balancer (ELBv2) query APIs over
//! reqwest, signed with AWS Signature V4.

pub mod alb;
pub mod client;
pub mod signing;

pub use alb::AlbClient;
pub use client::{ElbClient, LoadBalancerApi};
pub use signing::Credentials;

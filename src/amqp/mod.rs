//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
pub mod convenience;
mod factory;
mod publish;
pub mod topology;
pub use factory::ConnectionFactory;
pub(crate) use publish::publish;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties, ExchangeKind};

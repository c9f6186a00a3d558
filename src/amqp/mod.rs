//! AMQP integration for the ladder service
//!
//! Front-end commands arrive on a durable queue and are forwarded to the
//! ladder event loop; ladder events leave through a topic exchange.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{
    process_delivery, CommandHandler, DeliveryOutcome, LadderCommandConsumer, MockCommandHandler,
};
pub use messages::{MessageEnvelope, MessageUtils, COMMAND_ROUTING_KEY};
pub use publisher::{AmqpEventPublisher, EventPublisher, MockEventPublisher, PublisherConfig};

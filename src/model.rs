// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Models
//!
//! The closed set of topology templates the toolkit offers and the routing-key
//! resolution each of them applies when publishing.
//!
//! - `Simple` / `Work`: point-to-point and competing consumers over the default
//!   exchange; the queue name is the routing key.
//! - `Publish`: broadcast over a fanout exchange.
//! - `Routing` / `Topic`: direct or pattern routing with a key fixed at construction.
//! - `RoutingDynamic` / `TopicDynamic`: the caller supplies the key per message.

use crate::exchange::ExchangeKind;
use std::fmt;

/// A topology template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Simple,
    Work,
    Publish,
    Routing,
    RoutingDynamic,
    Topic,
    TopicDynamic,
}

/// What a variant declares and requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Exchange kind the variant forces; `None` means the default exchange.
    pub exchange_kind: Option<ExchangeKind>,
    pub requires_queue_name: bool,
    pub requires_exchange_name: bool,
    pub requires_binding_key: bool,
    /// Whether a consumer can be built for this variant.
    pub consumable: bool,
}

impl Variant {
    /// Every variant, in declaration order.
    pub const ALL: [Variant; 7] = [
        Variant::Simple,
        Variant::Work,
        Variant::Publish,
        Variant::Routing,
        Variant::RoutingDynamic,
        Variant::Topic,
        Variant::TopicDynamic,
    ];

    /// Describes what this variant declares and requires.
    ///
    /// # Returns
    /// The static capability row for the variant
    pub fn capabilities(self) -> Capabilities {
        match self {
            Variant::Simple | Variant::Work => Capabilities {
                exchange_kind: None,
                requires_queue_name: true,
                requires_exchange_name: false,
                requires_binding_key: false,
                consumable: true,
            },
            Variant::Publish => Capabilities {
                exchange_kind: Some(ExchangeKind::Fanout),
                requires_queue_name: false,
                requires_exchange_name: true,
                requires_binding_key: false,
                consumable: true,
            },
            Variant::Routing => Capabilities {
                exchange_kind: Some(ExchangeKind::Direct),
                requires_queue_name: false,
                requires_exchange_name: true,
                requires_binding_key: true,
                consumable: true,
            },
            Variant::Topic => Capabilities {
                exchange_kind: Some(ExchangeKind::Topic),
                requires_queue_name: false,
                requires_exchange_name: true,
                requires_binding_key: true,
                consumable: true,
            },
            Variant::RoutingDynamic => Capabilities {
                exchange_kind: Some(ExchangeKind::Direct),
                requires_queue_name: false,
                requires_exchange_name: true,
                requires_binding_key: false,
                consumable: false,
            },
            Variant::TopicDynamic => Capabilities {
                exchange_kind: Some(ExchangeKind::Topic),
                requires_queue_name: false,
                requires_exchange_name: true,
                requires_binding_key: false,
                consumable: false,
            },
        }
    }

    /// Whether messages go through the default exchange, addressed by queue name.
    pub fn uses_default_exchange(self) -> bool {
        self.capabilities().exchange_kind.is_none()
    }

    /// Whether the routing key always comes from the message.
    pub fn is_dynamic(self) -> bool {
        matches!(self, Variant::RoutingDynamic | Variant::TopicDynamic)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::Simple => "simple",
            Variant::Work => "work",
            Variant::Publish => "publish",
            Variant::Routing => "routing",
            Variant::RoutingDynamic => "routing-dynamic",
            Variant::Topic => "topic",
            Variant::TopicDynamic => "topic-dynamic",
        };
        f.write_str(name)
    }
}

/// Resolves the routing key a message is published with.
///
/// # Parameters
/// * `variant` - The topology template of the producer
/// * `static_key` - Key fixed at construction (Routing/Topic only)
/// * `queue_name` - Queue the producer addresses (Simple/Work only)
/// * `per_message_key` - Key carried by the message, possibly empty
pub fn resolve(
    variant: Variant,
    static_key: &str,
    queue_name: &str,
    per_message_key: &str,
) -> String {
    match variant {
        Variant::Simple | Variant::Work => queue_name.to_owned(),
        Variant::Publish => String::new(),
        Variant::Routing | Variant::Topic => {
            if per_message_key.is_empty() {
                static_key.to_owned()
            } else {
                per_message_key.to_owned()
            }
        }
        Variant::RoutingDynamic | Variant::TopicDynamic => per_message_key.to_owned(),
    }
}

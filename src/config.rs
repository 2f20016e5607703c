// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Configuration
//!
//! Connection parameters for the RabbitMQ server. Every field has a default
//! matching a stock local broker, so a partial configuration (from a file or
//! the environment) is always complete.

use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::env;
use tracing::warn;

/// Connection name used when `APP_NAME` is not set.
pub const DEFAULT_APP_NAME: &str = "rabbitmq-kit";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";

/// Connection parameters for a RabbitMQ broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// Reported to the broker as the connection name.
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            app_name: DEFAULT_APP_NAME.to_owned(),
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_owned(),
            password: DEFAULT_PASSWORD.to_owned(),
            vhost: DEFAULT_VHOST.to_owned(),
        }
    }
}

impl AmqpConfig {
    /// Defaults overridden by `APP_NAME`, `RABBITMQ_HOST`, `RABBITMQ_PORT`,
    /// `RABBITMQ_USER`, `RABBITMQ_PASSWORD` and `RABBITMQ_VHOST`.
    pub fn from_env() -> AmqpConfig {
        let mut cfg = AmqpConfig::default();

        if let Ok(name) = env::var("APP_NAME") {
            cfg.app_name = name;
        }
        if let Ok(host) = env::var("RABBITMQ_HOST") {
            cfg.host = host;
        }
        if let Ok(port) = env::var("RABBITMQ_PORT") {
            match port.parse() {
                Ok(port) => cfg.port = port,
                Err(_) => warn!(value = port, "ignoring invalid RABBITMQ_PORT"),
            }
        }
        if let Ok(user) = env::var("RABBITMQ_USER") {
            cfg.user = user;
        }
        if let Ok(password) = env::var("RABBITMQ_PASSWORD") {
            cfg.password = password;
        }
        if let Ok(vhost) = env::var("RABBITMQ_VHOST") {
            cfg.vhost = vhost;
        }

        cfg
    }

    /// Sets the name the connection is reported under.
    ///
    /// # Parameters
    /// * `name` - The application name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_app_name(mut self, name: &str) -> Self {
        self.app_name = name.to_owned();
        self
    }

    /// Sets the broker host.
    ///
    /// # Parameters
    /// * `host` - Host name or IP address
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_owned();
        self
    }

    /// Sets the broker port.
    ///
    /// # Parameters
    /// * `port` - The AMQP port, 5672 unless TLS is terminated elsewhere
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the user to authenticate as.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_user(mut self, user: &str) -> Self {
        self.user = user.to_owned();
        self
    }

    /// Sets the password for [`AmqpConfig::user`].
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_owned();
        self
    }

    /// Sets the virtual host.
    ///
    /// # Parameters
    /// * `vhost` - The vhost name, `/` for the root vhost
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    /// Builds the AMQP URI for this configuration.
    ///
    /// The vhost is carried verbatim, so the root vhost `/` needs no escaping.
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }
}

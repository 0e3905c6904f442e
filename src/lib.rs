//! # muxrpc
//!
//! A small RPC runtime that multiplexes many concurrent calls over a single
//! byte-stream connection.
//!
//! A connection opens with a JSON preamble that pins the body codec and the
//! timeout configuration; every frame after that is a header plus one body,
//! encoded by the selected codec. The client matches responses to
//! outstanding calls by sequence number; the server dispatches requests to
//! registered services and handles them in parallel while keeping response
//! writes atomic per connection.
//!
//! ## Server
//!
//! ```ignore
//! use std::sync::Arc;
//! use muxrpc::{Server, Service};
//!
//! let server = Arc::new(Server::new());
//! server.register(
//!     Service::builder("Arith")
//!         .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
//!         .build(),
//! )?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9007").await?;
//! server.accept(listener).await;
//! ```
//!
//! ## Client
//!
//! ```ignore
//! use muxrpc::Client;
//!
//! let client = Client::dial("127.0.0.1:9007").await?;
//! let sum: i32 = client.call("Arith.Sum", &Args { num1: 1, num2: 2 }).await?;
//! client.close().await?;
//! ```

pub mod codec;
pub mod error;
pub mod handshake;
pub mod service;

mod client;
mod server;

pub use client::{Call, Client, DoneSender};
pub use error::{Result, RpcError};
pub use handshake::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT, MAGIC_NUMBER};
pub use server::Server;
pub use service::{Method, Service, ServiceBuilder};

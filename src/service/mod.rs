//! Service registry: named receivers exposing callable methods.
//!
//! A [`Service`] is built once, up front, from typed async closures. Each
//! registered method is wrapped in a trampoline that decodes the argument
//! value from raw body bytes, invokes the handler, and encodes the reply,
//! so dispatch needs no type information at the call site.
//!
//! Eligibility mirrors the classic net/rpc rules: the service name and every
//! method name must be exported (leading uppercase), the argument type must
//! deserialize, the reply type must serialize, and the handler returns a
//! single `Result`. Non-exported method names are skipped with a warning;
//! a non-exported service name is a programming error and panics at build.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Args { num1: i32, num2: i32 }
//!
//! let svc = Service::builder("Arith")
//!     .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
//!     .build();
//! server.register(svc)?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecKind;
use crate::error::{Result, RpcError};

type MethodFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>;

/// Decode-invoke-encode wrapper built once per registered method.
type Trampoline = Box<dyn Fn(Bytes, CodecKind) -> MethodFuture + Send + Sync>;

/// A single callable method with its invocation counter.
pub struct Method {
    name: String,
    trampoline: Trampoline,
    num_calls: AtomicU64,
}

impl Method {
    /// Method name as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Times this method has been invoked, for observability.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode the argument from `body`, run the handler, encode the reply.
    ///
    /// Every error (argument decode, the handler's own, reply encode)
    /// comes back as the value the dispatcher turns into a response header
    /// error.
    pub(crate) fn invoke(&self, body: Bytes, kind: CodecKind) -> MethodFuture {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.trampoline)(body, kind)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A registered receiver: an exported name plus its eligible methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Start building a service.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not exported (leading uppercase). An invalid
    /// service name is unrecoverable misconfiguration.
    pub fn builder(name: &str) -> ServiceBuilder {
        if !is_exported(name) {
            panic!("rpc server: {} is not a valid service name", name);
        }
        ServiceBuilder {
            name: name.to_string(),
            methods: HashMap::new(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods.get(name)
    }

    /// Number of registered methods.
    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }
}

/// Fluent builder collecting a service's methods.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl ServiceBuilder {
    /// Register `name` with its handler.
    ///
    /// The handler takes the decoded argument and resolves to the reply.
    /// Handlers with a non-exported name are skipped, matching the
    /// introspection rule that only exported methods are callable.
    pub fn method<Arg, Reply, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Arg: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        F: Fn(Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        if !is_exported(name) {
            tracing::warn!(
                "rpc server: skipping non-exported method {}.{}",
                self.name,
                name
            );
            return self;
        }

        let trampoline: Trampoline = Box::new(move |body: Bytes, kind: CodecKind| {
            match kind.decode::<Arg>(&body) {
                Err(err) => {
                    let msg = format!("invalid argument: {}", err);
                    Box::pin(async move { Err(RpcError::Handler(msg)) }) as MethodFuture
                }
                Ok(arg) => {
                    let fut = handler(arg);
                    Box::pin(async move {
                        let reply = fut.await?;
                        kind.encode(&reply)
                    }) as MethodFuture
                }
            }
        });

        tracing::debug!("rpc server: register {}.{}", self.name, name);
        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                name: name.to_string(),
                trampoline,
                num_calls: AtomicU64::new(0),
            }),
        );
        self
    }

    /// Finish the service.
    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    fn arith() -> Service {
        Service::builder("Arith")
            .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
            .build()
    }

    #[test]
    fn test_builder_registers_exported_method() {
        let svc = arith();
        assert_eq!(svc.name(), "Arith");
        assert_eq!(svc.num_methods(), 1);
        assert!(svc.method("Sum").is_some());
    }

    #[test]
    fn test_non_exported_method_is_skipped() {
        let svc = Service::builder("Arith")
            .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
            .method("sum", |args: Args| async move { Ok(args.num1 + args.num2) })
            .build();

        assert_eq!(svc.num_methods(), 1);
        assert!(svc.method("sum").is_none());
    }

    #[test]
    #[should_panic(expected = "not a valid service name")]
    fn test_non_exported_service_name_panics() {
        let _ = Service::builder("arith");
    }

    #[tokio::test]
    async fn test_invoke_decodes_calls_and_encodes() {
        let svc = arith();
        let method = svc.method("Sum").unwrap();

        let kind = CodecKind::Msgpack;
        let body = kind.encode(&Args { num1: 1, num2: 2 }).unwrap();
        let reply = method.invoke(Bytes::from(body), kind).await.unwrap();

        let sum: i32 = kind.decode(&reply).unwrap();
        assert_eq!(sum, 3);
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_invoke_counts_every_call() {
        let svc = arith();
        let method = svc.method("Sum").unwrap();
        let kind = CodecKind::Msgpack;

        for _ in 0..3 {
            let body = kind.encode(&Args { num1: 2, num2: 2 }).unwrap();
            method.invoke(Bytes::from(body), kind).await.unwrap();
        }
        assert_eq!(method.num_calls(), 3);
    }

    #[tokio::test]
    async fn test_invoke_surfaces_handler_error() {
        let svc = Service::builder("Arith")
            .method("Div", |args: Args| async move {
                if args.num2 == 0 {
                    return Err(RpcError::handler("divide by zero"));
                }
                Ok(args.num1 / args.num2)
            })
            .build();

        let kind = CodecKind::Msgpack;
        let body = kind.encode(&Args { num1: 1, num2: 0 }).unwrap();
        let err = svc
            .method("Div")
            .unwrap()
            .invoke(Bytes::from(body), kind)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "divide by zero");
    }

    #[tokio::test]
    async fn test_invoke_rejects_undecodable_argument() {
        let svc = arith();
        let method = svc.method("Sum").unwrap();

        let err = method
            .invoke(Bytes::from_static(b"\xc1garbage"), CodecKind::Msgpack)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid argument"));
    }

    #[tokio::test]
    async fn test_map_reply_decodes_into_empty_capable_type() {
        use std::collections::HashMap as StdHashMap;

        let svc = Service::builder("Dict")
            .method("Pairs", |n: i32| async move {
                let mut out = StdHashMap::new();
                for i in 0..n {
                    out.insert(format!("k{}", i), i);
                }
                Ok(out)
            })
            .build();

        let kind = CodecKind::Msgpack;
        let body = kind.encode(&0i32).unwrap();
        let reply = svc
            .method("Pairs")
            .unwrap()
            .invoke(Bytes::from(body), kind)
            .await
            .unwrap();
        let decoded: StdHashMap<String, i32> = kind.decode(&reply).unwrap();
        assert!(decoded.is_empty());
    }
}

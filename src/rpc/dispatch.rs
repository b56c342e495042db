//! Method registration for requests issued by the peer.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;

/// Type-erased handler: encoded params in, encoded result or error text out.
pub(crate) type BoxedMethod =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, Vec<u8>>> + Send + Sync>;

/// Named handlers served to the peer.
///
/// A table can be shared by several clients (e.g. every connection accepted by
/// one listener).
#[derive(Default)]
pub struct MethodTable {
    methods: RwLock<HashMap<String, BoxedMethod>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous registration.
    ///
    /// Params are decoded into `Req`; an `Err(text)` from the handler is sent
    /// back as the response error.
    pub fn register<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let method: BoxedMethod = Arc::new(move |params: Vec<u8>| {
            let handler = Arc::clone(&handler);
            async move { invoke_typed(handler.as_ref(), params).await }.boxed()
        });

        let name = name.into();
        if self.methods.write().insert(name.clone(), method).is_some() {
            tracing::debug!(method = %name, "Replaced registered method");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler for `name`. Unknown methods and panics become error text.
    pub(crate) async fn invoke(&self, name: &str, params: Vec<u8>) -> Result<Vec<u8>, Vec<u8>> {
        let method = self.methods.read().get(name).cloned();
        let Some(method) = method else {
            return Err(format!("unknown method: {name}").into_bytes());
        };

        match AssertUnwindSafe(method(params)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = super::client::panic_message(panic.as_ref());
                tracing::warn!(method = %name, panic = %message, "Method handler panicked");
                Err(format!("handler panicked: {message}").into_bytes())
            }
        }
    }
}

async fn invoke_typed<Req, Resp, F, Fut>(handler: &F, params: Vec<u8>) -> Result<Vec<u8>, Vec<u8>>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Result<Resp, String>>,
{
    let request: Req =
        codec::decode(&params).map_err(|e| format!("invalid params: {e}").into_bytes())?;
    let response = handler(request).await.map_err(String::into_bytes)?;
    codec::encode(&response).map_err(|e| format!("invalid result: {e}").into_bytes())
}

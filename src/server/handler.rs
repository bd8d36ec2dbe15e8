use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use crate::{Result, RpcError};

pub(super) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased async handler.
///
/// Takes the raw payload of an inbound message and produces the raw reply
/// payload. Handler failures come back as [`RpcError::Handler`].
pub(super) trait HandlerFn: Send + Sync {
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// JSON handler: decodes `TReq`, encodes `TResp`.
pub(super) struct JsonHandler<F, Fut, TReq, TResp, E> {
    func: F,
    _phantom: PhantomData<fn(TReq) -> (Fut, TResp, E)>,
}

impl<F, Fut, TReq, TResp, E> JsonHandler<F, Fut, TReq, TResp, E> {
    pub(super) fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut, TReq, TResp, E> HandlerFn for JsonHandler<F, Fut, TReq, TResp, E>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<TResp, E>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        // ---
        let req: TReq = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                let reason = format!("invalid request payload: {e}");
                return Box::pin(async move { Err(RpcError::Handler(reason)) });
            }
        };

        let fut = (self.func)(req);

        Box::pin(async move {
            let resp = fut.await.map_err(|e| RpcError::Handler(e.to_string()))?;
            let bytes = serde_json::to_vec(&resp)?;
            Ok(Bytes::from(bytes))
        })
    }
}

/// Raw handler: payload bytes in, reply bytes out.
pub(super) struct RawHandler<F, Fut, E> {
    func: F,
    _phantom: PhantomData<fn() -> (Fut, E)>,
}

impl<F, Fut, E> RawHandler<F, Fut, E> {
    pub(super) fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut, E> HandlerFn for RawHandler<F, Fut, E>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        let fut = (self.func)(payload);
        Box::pin(async move { fut.await.map_err(|e| RpcError::Handler(e.to_string())) })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Print {
        text: String,
    }

    #[tokio::test]
    async fn test_json_handler_roundtrip() {
        // ---
        let handler = JsonHandler::new(|req: Print| async move {
            Ok::<_, String>(format!("printed {}", req.text))
        });

        let out = handler.call(Bytes::from_static(br#"{"text":"hi"}"#)).await.unwrap();
        assert_eq!(out.as_ref(), br#""printed hi""#);
    }

    #[tokio::test]
    async fn test_json_handler_rejects_bad_payload() {
        // ---
        let handler = JsonHandler::new(|req: Print| async move { Ok::<_, String>(req.text) });

        match handler.call(Bytes::from_static(b"not json")).await {
            Err(RpcError::Handler(reason)) => assert!(reason.starts_with("invalid request payload")),
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_is_stringified() {
        // ---
        let handler = RawHandler::new(|_: Bytes| async move { Err::<Bytes, _>("disk full") });

        match handler.call(Bytes::new()).await {
            Err(RpcError::Handler(reason)) => assert_eq!(reason, "disk full"),
            other => panic!("expected handler error, got {other:?}"),
        }
    }
}

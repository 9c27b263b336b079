//! Deferred resource attributes and their combinators
//!
//! Every cross-resource data flow in this library goes through [`Output`], a
//! single-assignment future for a value that is not known until the
//! orchestration engine has created the resource that produces it. Outputs
//! are cheaply cloneable and resolve to the same value on every await.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Errors surfaced when awaiting a deferred value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutputError {
    #[error("deferred value was dropped before being fulfilled")]
    Unfulfilled,

    #[error("deferred computation failed: {0}")]
    Failed(String),
}

type SharedFuture<T> = Shared<BoxFuture<'static, Result<T, OutputError>>>;

/// A single-assignment future for a resource attribute.
///
/// Supports functional composition (`apply`, `all`, `zip`, string
/// interpolation) so declarations can be wired together before any attribute
/// has resolved. The combinators never block; resolution happens once, at the
/// final `resolve` of the derived value.
pub struct Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: SharedFuture<T>,
}

impl<T> Clone for Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peek() {
            Some(Ok(_)) => f.write_str("Output(<resolved>)"),
            Some(Err(e)) => write!(f, "Output(<error: {}>)", e),
            None => f.write_str("Output(<pending>)"),
        }
    }
}

impl<T> Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// An output whose value is already known.
    pub fn known(value: T) -> Self {
        Self::from_result_future(std::future::ready(Ok(value)))
    }

    /// Wrap an async computation as an output.
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::from_result_future(async move { Ok(fut.await) })
    }

    fn from_result_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, OutputError>> + Send + 'static,
    {
        Self {
            inner: fut.boxed().shared(),
        }
    }

    /// An unfulfilled output together with its write-once resolver.
    ///
    /// Awaiting the output after the resolver is dropped without fulfilling
    /// yields [`OutputError::Unfulfilled`].
    pub fn pending() -> (OutputResolver<T>, Output<T>) {
        let (tx, rx) = futures::channel::oneshot::channel::<T>();
        let output =
            Self::from_result_future(async move { rx.await.map_err(|_| OutputError::Unfulfilled) });
        (OutputResolver { tx }, output)
    }

    /// Derive a new output by mapping the resolved value.
    pub fn apply<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let prev = self.inner.clone();
        Output::from_result_future(async move { prev.await.map(f) })
    }

    /// Combine two outputs into one pair.
    pub fn zip<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let a = self.inner.clone();
        let b = other.inner.clone();
        Output::from_result_future(async move {
            let (ra, rb) = futures::join!(a, b);
            Ok((ra?, rb?))
        })
    }

    /// Combine a list of outputs into one output of the list, preserving
    /// order. The first error wins.
    pub fn all(outputs: Vec<Output<T>>) -> Output<Vec<T>> {
        let futs: Vec<_> = outputs.into_iter().map(|o| o.inner).collect();
        Output::from_result_future(async move {
            let resolved = futures::future::join_all(futs).await;
            resolved.into_iter().collect()
        })
    }

    /// Await the value. Resolving the same output repeatedly returns the
    /// same result.
    pub async fn resolve(&self) -> Result<T, OutputError> {
        self.inner.clone().await
    }
}

impl Output<String> {
    /// Concatenate string outputs in order.
    pub fn concat(parts: Vec<Output<String>>) -> Output<String> {
        Output::all(parts).apply(|resolved| resolved.concat())
    }

    /// Interpolate string outputs into a `{}`-placeholder template.
    pub fn format(template: &str, args: Vec<Output<String>>) -> Output<String> {
        let segments: Vec<String> = template.split("{}").map(str::to_string).collect();
        Output::all(args).apply(move |values| {
            let mut rendered = String::new();
            for (i, segment) in segments.iter().enumerate() {
                rendered.push_str(segment);
                if let Some(value) = values.get(i) {
                    rendered.push_str(value);
                }
            }
            rendered
        })
    }
}

impl From<&str> for Output<String> {
    fn from(value: &str) -> Self {
        Output::known(value.to_string())
    }
}

impl From<String> for Output<String> {
    fn from(value: String) -> Self {
        Output::known(value)
    }
}

/// Write-once fulfillment half of a pending [`Output`].
pub struct OutputResolver<T> {
    tx: futures::channel::oneshot::Sender<T>,
}

impl<T> OutputResolver<T> {
    /// Fulfill the paired output. Consumes the resolver; a value can be
    /// assigned at most once.
    pub fn fulfill(self, value: T) {
        let _ = self.tx.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_resolves_immediately() {
        let out = Output::known(42);
        assert_eq!(out.resolve().await, Ok(42));
    }

    #[tokio::test]
    async fn apply_maps_resolved_value() {
        let out = Output::known("vpc-123".to_string()).apply(|id| format!("arn:{}", id));
        assert_eq!(out.resolve().await.unwrap(), "arn:vpc-123");
    }

    #[tokio::test]
    async fn pending_resolves_after_fulfill() {
        let (resolver, out) = Output::pending();
        resolver.fulfill("subnet-1".to_string());
        assert_eq!(out.resolve().await.unwrap(), "subnet-1");
    }

    #[tokio::test]
    async fn dropped_resolver_yields_unfulfilled() {
        let (resolver, out) = Output::<String>::pending();
        drop(resolver);
        assert_eq!(out.resolve().await, Err(OutputError::Unfulfilled));
    }

    #[tokio::test]
    async fn all_preserves_order() {
        let outputs = vec![
            Output::known("a".to_string()),
            Output::known("b".to_string()),
            Output::known("c".to_string()),
        ];
        assert_eq!(
            Output::all(outputs).resolve().await.unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn format_interpolates_in_order() {
        let url = Output::format(
            "redis://{}:{}",
            vec![Output::known("cache.internal".to_string()), Output::known("6379".to_string())],
        );
        assert_eq!(url.resolve().await.unwrap(), "redis://cache.internal:6379");
    }

    #[tokio::test]
    async fn concat_joins_parts_in_order() {
        let joined = Output::concat(vec![
            Output::known("arn:".to_string()),
            Output::known("bucket".to_string()),
            Output::known("/*".to_string()),
        ]);
        assert_eq!(joined.resolve().await.unwrap(), "arn:bucket/*");
    }

    #[tokio::test]
    async fn clones_share_resolution() {
        let (resolver, out) = Output::pending();
        let other = out.clone();
        resolver.fulfill("one".to_string());
        assert_eq!(out.resolve().await.unwrap(), "one");
        assert_eq!(other.resolve().await.unwrap(), "one");
    }
}

pub mod embeddings;

use async_trait::async_trait;

pub use embeddings::HttpEmbedder;

/// Turns text into a fixed-length vector.
///
/// The sync and search engines treat this as an opaque, possibly slow and
/// possibly failing call; they apply their own timeouts around it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Model identifier, for logs and status output.
    fn model(&self) -> &str;
}

/// Embed `text`, bounding the call by `timeout` and rejecting vectors that
/// could not be indexed (empty, or containing NaN or infinity).
pub async fn embed_with_timeout(
    embedder: &dyn EmbeddingProvider,
    text: &str,
    timeout: std::time::Duration,
) -> crate::error::Result<Vec<f32>> {
    use crate::error::Error;

    let vector = match tokio::time::timeout(timeout, embedder.embed(text)).await {
        Ok(Ok(vector)) => vector,
        Ok(Err(e)) => return Err(Error::EmbeddingFailure(format!("{e:#}"))),
        Err(_) => {
            return Err(Error::EmbeddingFailure(format!(
                "timed out after {:?}",
                timeout
            )))
        }
    };

    if vector.is_empty() {
        return Err(Error::EmbeddingFailure(
            "provider returned an empty vector".to_string(),
        ));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::EmbeddingFailure(
            "provider returned non-finite components".to_string(),
        ));
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    struct Fixed(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }

        fn model(&self) -> &str {
            "fixed"
        }
    }

    struct Slow;

    #[async_trait]
    impl EmbeddingProvider for Slow {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0])
        }

        fn model(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_valid_vector_passes_through() {
        let v = embed_with_timeout(&Fixed(vec![0.5, 0.5]), "x", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(v, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_empty_and_nan_vectors_rejected() {
        let err = embed_with_timeout(&Fixed(vec![]), "x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailure(_)));

        let err = embed_with_timeout(&Fixed(vec![1.0, f32::NAN]), "x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailure(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_embedding_failure() {
        let err = embed_with_timeout(&Slow, "x", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailure(ref m) if m.contains("timed out")));
    }
}

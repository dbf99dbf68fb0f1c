//! Decoder factory
//!
//! Maps format tags to decoder constructors. `create` always returns a fresh
//! decoder. Registration takes the write lock, lookups the read lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::decoder::StreamDecoder;
use super::event::StreamFormat;
use super::ndjson::NdjsonDecoder;
use super::sse::SseDecoder;
use crate::error::LlmError;

pub type DecoderConstructor = Arc<dyn Fn() -> Box<dyn StreamDecoder> + Send + Sync>;

pub struct DecoderFactory {
    constructors: RwLock<HashMap<StreamFormat, DecoderConstructor>>,
}

impl std::fmt::Debug for DecoderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderFactory")
            .field("formats", &self.formats())
            .finish()
    }
}

impl Default for DecoderFactory {
    fn default() -> Self {
        let factory = Self::empty();
        factory.register(StreamFormat::Sse, || Box::new(SseDecoder::new()));
        factory.register(StreamFormat::Ndjson, || Box::new(NdjsonDecoder::new()));
        factory.register(StreamFormat::JsonStream, || {
            Box::new(NdjsonDecoder::json_stream())
        });
        factory
    }
}

impl DecoderFactory {
    /// Factory with the built-in SSE and NDJSON decoders.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the constructor for `format`.
    pub fn register<F>(&self, format: StreamFormat, ctor: F)
    where
        F: Fn() -> Box<dyn StreamDecoder> + Send + Sync + 'static,
    {
        let mut map = match self.constructors.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(format, Arc::new(ctor));
    }

    pub fn create(&self, format: &StreamFormat) -> Result<Box<dyn StreamDecoder>, LlmError> {
        let ctor = {
            let map = match self.constructors.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.get(format).cloned()
        };
        match ctor {
            Some(ctor) => Ok(ctor()),
            None => Err(LlmError::UnsupportedOperation(format!(
                "no stream decoder registered for format '{format}'"
            ))),
        }
    }

    pub fn supports(&self, format: &StreamFormat) -> bool {
        match self.constructors.read() {
            Ok(guard) => guard.contains_key(format),
            Err(poisoned) => poisoned.into_inner().contains_key(format),
        }
    }

    pub fn formats(&self) -> Vec<StreamFormat> {
        let map = match self.constructors.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::decoder::ByteReader;
    use crate::streaming::event::StreamEvent;
    use async_trait::async_trait;

    struct Pipe;

    #[async_trait]
    impl StreamDecoder for Pipe {
        async fn decode(
            &mut self,
            _reader: &mut ByteReader,
        ) -> Result<Option<StreamEvent>, LlmError> {
            Ok(Some(StreamEvent::message("x")))
        }

        fn format(&self) -> StreamFormat {
            StreamFormat::Custom("pipe".into())
        }
    }

    #[test]
    fn builtins_and_custom_registration() {
        let factory = DecoderFactory::new();
        assert_eq!(factory.create(&StreamFormat::Sse).unwrap().format(), StreamFormat::Sse);
        assert_eq!(
            factory.create(&StreamFormat::JsonStream).unwrap().format(),
            StreamFormat::JsonStream
        );

        let custom = StreamFormat::Custom("pipe".into());
        assert!(factory.create(&custom).is_err());
        factory.register(custom.clone(), || Box::new(Pipe));
        assert!(factory.supports(&custom));
        assert_eq!(factory.create(&custom).unwrap().format(), custom);
    }

    #[tokio::test]
    async fn create_returns_independent_decoders() {
        let factory = DecoderFactory::new();
        let mut a = factory.create(&StreamFormat::Sse).unwrap();
        let mut b = factory.create(&StreamFormat::Sse).unwrap();
        let mut ra: &[u8] = b"id: 7\ndata: a\n\n";
        let mut rb: &[u8] = b"data: b\n\n";
        assert_eq!(a.decode(&mut ra).await.unwrap().unwrap().id.as_deref(), Some("7"));
        assert_eq!(b.decode(&mut rb).await.unwrap().unwrap().id, None);
    }

    #[test]
    fn concurrent_registration() {
        let factory = Arc::new(DecoderFactory::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let f = factory.clone();
                std::thread::spawn(move || {
                    f.register(StreamFormat::Custom(format!("c{i}")), || Box::new(Pipe));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(factory.formats().len(), 3 + 8);
    }
}

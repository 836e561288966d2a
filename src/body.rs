//! Response body definitions.
//!
//! Most responses the gateway produces are a single pre-buffered chunk
//! (XML documents, error bodies); only content downloads stream. [`Body`]
//! implements both `Stream` and `http_body::Body` so it plugs into any
//! framework that works with the `http` types.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream};
use http::header::HeaderMap;
use http_body::{Body as HttpBody, SizeHint};

/// Body returned by the webdav handler.
pub struct Body(Kind);

enum Kind {
    Empty,
    Once(Bytes),
    Stream(BoxStream<'static, Result<Bytes, io::Error>>),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body(Kind::Empty)
    }

    /// A body built from a stream of chunks.
    pub fn stream(stream: impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static) -> Body {
        Body(Kind::Stream(Box::pin(stream)))
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        // A buffered chunk is yielded exactly once, after which the
        // body degrades to `Empty`.
        match std::mem::replace(&mut self.0, Kind::Empty) {
            Kind::Empty => Poll::Ready(None),
            Kind::Once(bytes) => Poll::Ready(Some(Ok(bytes))),
            Kind::Stream(mut stream) => {
                let res = stream.as_mut().poll_next(cx);
                self.0 = Kind::Stream(stream);
                res
            }
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        self.poll_next(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }

    fn size_hint(&self) -> SizeHint {
        match &self.0 {
            Kind::Empty => SizeHint::with_exact(0),
            Kind::Once(b) => SizeHint::with_exact(b.len() as u64),
            Kind::Stream(_) => SizeHint::default(),
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.0, Kind::Empty)
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Body {
        if b.is_empty() {
            Body(Kind::Empty)
        } else {
            Body(Kind::Once(b))
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Body {
        Body::from(Bytes::from(s.to_string()))
    }
}

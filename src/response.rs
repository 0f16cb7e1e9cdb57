use std::fmt;

use bytes::Bytes;
use http::{header::HeaderMap, Extensions, StatusCode, Uri, Version};
use http_body_util::BodyExt;

use crate::{body::ResponseBody, error::Error};

/// A Response to a submitted `Request`.
pub struct Response {
    res: http::Response<ResponseBody>,
    uri: Uri,
}

impl Response {
    pub(crate) fn new(res: http::Response<ResponseBody>, uri: Uri) -> Response {
        Response { res, uri }
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.res.status()
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.res.version()
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.res.headers()
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.res.headers_mut()
    }

    /// Get the final `Uri` of this `Response`, after any redirects.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get the content length of the response, if it is known.
    pub fn content_length(&self) -> Option<u64> {
        use http_body::Body;

        Body::size_hint(self.res.body()).exact()
    }

    /// Returns a reference to the associated extensions.
    pub fn extensions(&self) -> &Extensions {
        self.res.extensions()
    }

    /// Returns a mutable reference to the associated extensions.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        self.res.extensions_mut()
    }

    /// Stream the next chunk of the response body.
    ///
    /// The reader pulls; nothing is buffered beyond the chunk in flight.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn run() -> Result<(), courier::Error> {
    /// let mut res = courier::Client::new()
    ///     .get("http://httpbin.org/ip")
    ///     .send()
    ///     .await?;
    ///
    /// while let Some(chunk) = res.chunk().await? {
    ///     println!("Chunk: {chunk:?}");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        loop {
            match self.res.body_mut().frame().await {
                Some(Ok(frame)) => {
                    // skip non-data frames
                    if let Ok(data) = frame.into_data() {
                        return Ok(Some(data));
                    }
                }
                Some(Err(err)) => {
                    return Err(match err.downcast::<Error>() {
                        Ok(err) => *err,
                        Err(err) => Error::body(err),
                    })
                }
                None => return Ok(None),
            }
        }
    }

    /// Collect the full response body as `Bytes`.
    pub async fn bytes(self) -> crate::Result<Bytes> {
        let collected = self
            .res
            .into_body()
            .collect()
            .await
            .map_err(|err| match err.downcast::<Error>() {
                Ok(err) => *err,
                Err(err) => Error::body(err),
            })?;
        Ok(collected.to_bytes())
    }

    /// Collect the full response body as text (lossy UTF-8).
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Turn a response into an error if the server returned an error
    /// status.
    pub fn error_for_status(self) -> crate::Result<Response> {
        let status = self.status();
        if status.is_client_error() || status.is_server_error() {
            Err(Error::status_code(self.uri.clone(), status))
        } else {
            Ok(self)
        }
    }

    /// Turn a reference to a response into an error if the server
    /// returned an error status.
    pub fn error_for_status_ref(&self) -> crate::Result<&Response> {
        let status = self.status();
        if status.is_client_error() || status.is_server_error() {
            Err(Error::status_code(self.uri.clone(), status))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("uri", &self.uri)
            .field("status", &self.status())
            .field("headers", self.headers())
            .finish()
    }
}

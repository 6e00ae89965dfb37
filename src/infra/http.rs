use anyhow::{Context, Error};
use async_trait::async_trait;

use crate::domain::{
    error::PlatformError,
    model::{HttpResponse, HttpVerb, ProbeRequest},
    port::HttpProbe,
};

#[derive(Clone, Default)]
pub struct ReqwestProbe {
    client: reqwest::Client,
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn send(&self, request: ProbeRequest) -> Result<HttpResponse, Error> {
        let builder = match request.verb {
            HttpVerb::Get => self.client.get(&request.url),
            HttpVerb::Delete => self.client.delete(&request.url),
            HttpVerb::Put => self.client.put(&request.url),
            HttpVerb::Post => self.client.post(&request.url),
        };
        let builder = match request.body {
            Some(body) => builder.body(body),
            None => builder,
        };
        let response = builder
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    Error::from(PlatformError::Timeout(request.url.clone()))
                } else {
                    Error::from(error)
                }
            })
            .with_context(|| format!("Can't reach {}", request.url))?;
        let code = response.status().as_u16();
        let body = response
            .text()
            .await
            .with_context(|| format!("Can't read response body of {}", request.url))?;
        Ok(HttpResponse { code, body })
    }
}

//! Detection backend over `window.fetch`

use std::rc::Rc;

use iris_core::{DetectionBackend, LookupError, detection_request_url};
use iris_types::EngineConfig;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::Response;

use crate::host::js_message;

#[derive(Clone)]
pub struct FetchBackend {
    config: Rc<EngineConfig>,
}

impl FetchBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Rc::new(config),
        }
    }
}

impl DetectionBackend for FetchBackend {
    async fn fetch_detections(&self, image_url: &str) -> Result<String, LookupError> {
        let url = detection_request_url(&self.config, image_url)?;
        let window =
            web_sys::window().ok_or_else(|| LookupError::Network("no window".to_string()))?;

        let response = JsFuture::from(window.fetch_with_str(url.as_str()))
            .await
            .map_err(|e| LookupError::Network(js_message(&e)))?;
        let response: Response = response
            .dyn_into()
            .map_err(|_| LookupError::Malformed("fetch did not yield a Response".to_string()))?;

        if !response.ok() {
            return Err(LookupError::Status(response.status()));
        }

        let text = response
            .text()
            .map_err(|e| LookupError::Network(js_message(&e)))?;
        let body = JsFuture::from(text)
            .await
            .map_err(|e| LookupError::Network(js_message(&e)))?;
        body.as_string()
            .ok_or_else(|| LookupError::Malformed("response body is not text".to_string()))
    }
}

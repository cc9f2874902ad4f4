use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{EngineResult, GenerationError};
use crate::transport::{BackendTransport, HttpMethod, HttpReply, HttpRequest};

struct Route {
    method: HttpMethod,
    fragment: String,
    replies: VecDeque<EngineResult<HttpReply>>,
}

/// Transport that answers from scripted replies. Routes match on method
/// and a URL fragment; the last reply of a route repeats.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route(
        self,
        method: HttpMethod,
        fragment: &str,
        replies: Vec<EngineResult<HttpReply>>,
    ) -> Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Route {
                method,
                fragment: fragment.to_string(),
                replies: replies.into(),
            });
        }
        self
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, method: HttpMethod, fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.method == method && request.url.contains(fragment))
            .count()
    }
}

impl BackendTransport for ScriptedTransport {
    fn send(&self, request: HttpRequest) -> EngineResult<HttpReply> {
        if let Ok(mut rows) = self.requests.lock() {
            rows.push(request.clone());
        }
        let mut routes = self.routes.lock().map_err(|_| GenerationError::Transport {
            context: "scripted".to_string(),
            message: "lock poisoned".to_string(),
        })?;
        let route = routes
            .iter_mut()
            .find(|route| route.method == request.method && request.url.contains(&route.fragment));
        let Some(route) = route else {
            return Err(GenerationError::Transport {
                context: request.url.clone(),
                message: "no scripted reply".to_string(),
            });
        };
        if route.replies.len() > 1 {
            if let Some(reply) = route.replies.pop_front() {
                return reply;
            }
        }
        route
            .replies
            .front()
            .cloned()
            .unwrap_or_else(|| Err(GenerationError::Transport {
                context: request.url.clone(),
                message: "route has no replies".to_string(),
            }))
    }
}

pub(crate) fn json_reply(status: u16, body: Value) -> EngineResult<HttpReply> {
    Ok(HttpReply {
        status,
        content_type: Some("application/json".to_string()),
        body: serde_json::to_vec(&body).unwrap_or_default(),
    })
}

pub(crate) fn bytes_reply(status: u16, content_type: &str, body: &[u8]) -> EngineResult<HttpReply> {
    Ok(HttpReply {
        status,
        content_type: Some(content_type.to_string()),
        body: body.to_vec(),
    })
}

/// Encoded 2x1 RGBA PNG with one transparent pixel.
pub(crate) fn tiny_png() -> Vec<u8> {
    let mut image = image::RgbaImage::new(2, 1);
    image.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
    image.put_pixel(1, 0, image::Rgba([0, 0, 0, 0]));
    let mut out = std::io::Cursor::new(Vec::new());
    let _ = image::DynamicImage::ImageRgba8(image).write_to(&mut out, image::ImageFormat::Png);
    out.into_inner()
}

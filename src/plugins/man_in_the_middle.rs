//! Swaps every upstream chunk for a canned response.

use bytes::Bytes;

use crate::http::{build_http_response, Headers};
use crate::proxy::plugin::{HttpProxyPlugin, PluginContext};

pub const BODY: &[u8] = b"Hello from man in the middle";

#[derive(Debug, Default)]
pub struct ManInTheMiddle;

pub fn factory(_ctx: &PluginContext) -> Box<dyn HttpProxyPlugin> {
    Box::new(ManInTheMiddle)
}

impl HttpProxyPlugin for ManInTheMiddle {
    fn name(&self) -> &'static str {
        "man_in_the_middle"
    }

    fn handle_upstream_chunk(&mut self, _chunk: Bytes) -> Bytes {
        build_http_response(200, Some("OK"), &Headers::new(), Some(BODY)).into()
    }
}

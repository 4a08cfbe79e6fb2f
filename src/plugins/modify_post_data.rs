//! Replaces the body of every POST request.

use std::ops::ControlFlow;

use crate::http::HttpParser;
use crate::proxy::plugin::{HttpProxyPlugin, PluginContext};

pub const MODIFIED_BODY: &[u8] = br#"{"key": "modified"}"#;

#[derive(Debug, Default)]
pub struct ModifyPostData;

pub fn factory(_ctx: &PluginContext) -> Box<dyn HttpProxyPlugin> {
    Box::new(ModifyPostData)
}

impl HttpProxyPlugin for ModifyPostData {
    fn name(&self) -> &'static str {
        "modify_post_data"
    }

    fn handle_client_request(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        if request.method() == Some("POST") {
            request.set_body(MODIFIED_BODY);
            // drop any duplicate Content-Type before setting ours
            request.del_header("Content-Type");
            request.add_header("Content-Type", "application/json");
        }
        ControlFlow::Continue(())
    }
}

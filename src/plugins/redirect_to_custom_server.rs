//! Sends every plain HTTP request to a fixed upstream instead of the one it names.

use std::ops::ControlFlow;

use tracing::warn;

use crate::http::HttpParser;
use crate::proxy::plugin::{HttpProxyPlugin, PluginContext};

pub const UPSTREAM_SERVER: &str = "http://localhost:8899/";
const UPSTREAM_NETLOC: &str = "localhost:8899";

#[derive(Debug, Default)]
pub struct RedirectToCustomServer;

pub fn factory(_ctx: &PluginContext) -> Box<dyn HttpProxyPlugin> {
    Box::new(RedirectToCustomServer)
}

impl HttpProxyPlugin for RedirectToCustomServer {
    fn name(&self) -> &'static str {
        "redirect_to_custom_server"
    }

    fn before_upstream_connection(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        if request.is_connect() {
            return ControlFlow::Continue(());
        }
        if let Err(e) = request.set_url(UPSTREAM_SERVER) {
            warn!("Unable to redirect request: {}", e);
            return ControlFlow::Continue(());
        }
        // upstream may reject a Host it does not serve
        request.del_header("Host");
        request.add_header("Host", UPSTREAM_NETLOC);
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_redirected() {
        let mut request = HttpParser::parse_request(
            b"GET http://example.org/get HTTP/1.1\r\nHost: example.org\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();
        let mut plugin = RedirectToCustomServer;

        assert!(plugin.before_upstream_connection(&mut request).is_continue());
        assert_eq!(
            request.upstream_address(),
            Some(("localhost".to_string(), 8899))
        );
        assert_eq!(request.path(), Some("/"));
        assert_eq!(request.headers().get_str("Host"), Some("localhost:8899"));
        assert_eq!(
            request.build(&[]).unwrap(),
            b"GET / HTTP/1.1\r\nAccept: */*\r\nHost: localhost:8899\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_connect_untouched() {
        let mut request =
            HttpParser::parse_request(b"CONNECT example.org:443 HTTP/1.1\r\n\r\n").unwrap();
        let _ = RedirectToCustomServer.before_upstream_connection(&mut request);
        assert_eq!(request.upstream_address(), Some(("example.org".to_string(), 443)));
    }
}

//! Rejects requests to blocked hosts before any upstream connection is made.

use std::ops::ControlFlow;

use tracing::info;

use crate::http::{build_http_response, Headers, HttpParser, PROXY_AGENT};
use crate::proxy::plugin::{ClientHandle, HttpProxyPlugin, PluginContext};

pub const BLOCKED_HOSTS: &[&str] = &["google.com", "www.google.com"];

#[derive(Debug)]
pub struct FilterByUpstreamHost {
    client: ClientHandle,
}

pub fn factory(ctx: &PluginContext) -> Box<dyn HttpProxyPlugin> {
    Box::new(FilterByUpstreamHost {
        client: ctx.client.clone(),
    })
}

fn is_blocked(request: &HttpParser) -> bool {
    let host = request
        .upstream_address()
        .map(|(host, _)| host)
        .unwrap_or_default();
    BLOCKED_HOSTS
        .iter()
        .any(|blocked| blocked.eq_ignore_ascii_case(&host))
}

impl HttpProxyPlugin for FilterByUpstreamHost {
    fn name(&self) -> &'static str {
        "filter_by_upstream_host"
    }

    fn before_upstream_connection(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        if !is_blocked(request) {
            return ControlFlow::Continue(());
        }
        info!("Blocked request to {:?}", request.host());
        let headers: Headers = [("Proxy-Agent", PROXY_AGENT)].into_iter().collect();
        self.client
            .queue(build_http_response(418, Some("I'm a tea pot"), &headers, None));
        ControlFlow::Break(())
    }

    fn handle_client_request(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        if is_blocked(request) {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> (FilterByUpstreamHost, crate::proxy::plugin::ClientOutbox) {
        let (client, outbox) = ClientHandle::new(None);
        (FilterByUpstreamHost { client }, outbox)
    }

    #[test]
    fn test_blocked_host_gets_teapot() {
        let (mut plugin, mut outbox) = plugin();
        let mut request =
            HttpParser::parse_request(b"GET http://google.com/ HTTP/1.1\r\nHost: google.com\r\n\r\n")
                .unwrap();

        assert!(plugin.before_upstream_connection(&mut request).is_break());
        assert!(plugin.handle_client_request(&mut request).is_break());

        let queued = outbox.drain();
        assert_eq!(queued.len(), 1);
        let expected = format!(
            "HTTP/1.1 418 I'm a tea pot\r\nProxy-Agent: {}\r\n\r\n",
            PROXY_AGENT
        );
        assert_eq!(&queued[0][..], expected.as_bytes());
    }

    #[test]
    fn test_other_hosts_pass() {
        let (mut plugin, mut outbox) = plugin();
        let mut request =
            HttpParser::parse_request(b"GET http://example.org/ HTTP/1.1\r\n\r\n").unwrap();
        assert!(plugin.before_upstream_connection(&mut request).is_continue());
        assert!(plugin.handle_client_request(&mut request).is_continue());
        assert!(outbox.drain().is_empty());
    }
}

//! Single-word hosts resolved from a fixed table, e.g. `http://g/` goes to Google.
//!
//! Short names never reach DNS: the upstream connection is suppressed and
//! the client gets a redirect (or a 404 for unknown names).

use std::ops::ControlFlow;

use crate::http::{build_http_response, Headers, HttpParser};
use crate::proxy::plugin::{ClientHandle, HttpProxyPlugin, PluginContext};

pub const SHORT_LINKS: &[(&str, &str)] = &[
    ("a", "amazon.com"),
    ("i", "instagram.com"),
    ("l", "linkedin.com"),
    ("f", "facebook.com"),
    ("g", "google.com"),
    ("t", "twitter.com"),
    ("w", "web.whatsapp.com"),
    ("y", "youtube.com"),
    ("proxy", "localhost:8899"),
];

#[derive(Debug)]
pub struct ShortLink {
    client: ClientHandle,
}

pub fn factory(ctx: &PluginContext) -> Box<dyn HttpProxyPlugin> {
    Box::new(ShortLink {
        client: ctx.client.clone(),
    })
}

fn short_name(request: &HttpParser) -> Option<String> {
    let (host, _) = request.upstream_address()?;
    (host != "localhost" && !host.contains('.') && !host.contains(':')).then_some(host)
}

impl HttpProxyPlugin for ShortLink {
    fn name(&self) -> &'static str {
        "shortlink"
    }

    fn before_upstream_connection(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        match short_name(request) {
            Some(_) => ControlFlow::Break(()),
            None => ControlFlow::Continue(()),
        }
    }

    fn handle_client_request(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        let Some(name) = short_name(request) else {
            return ControlFlow::Continue(());
        };

        let target = SHORT_LINKS
            .iter()
            .find(|(short, _)| short.eq_ignore_ascii_case(&name))
            .map(|(_, target)| *target);
        let packet = match target {
            Some(target) => {
                let path = request.path().unwrap_or("/");
                let location = format!("http://{}{}", target, path);
                let headers: Headers = [
                    ("Location", location.as_str()),
                    ("Content-Length", "0"),
                    ("Connection", "close"),
                ]
                .into_iter()
                .collect();
                build_http_response(303, Some("See Other"), &headers, None)
            }
            None => build_http_response(404, Some("Not Found"), &Headers::new(), Some(b"Not Found")),
        };
        self.client.queue(packet);
        ControlFlow::Break(())
    }
}

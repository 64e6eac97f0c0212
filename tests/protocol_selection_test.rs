use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;

use soapbind::descriptor::{MethodBuilder, MethodDescriptor, ParameterInfo, ServiceDescriptor};
use soapbind::param::{HttpRequestMethod, SOAP11_ENVELOPE_NS, SOAP12_ENVELOPE_NS};
use soapbind::request::HttpRequest;
use soapbind::value::{ReturnType, TypeTag, Value};
use soapbind::{Config, Exception, HttpResponse, ProtocolKind, ServiceHost, WebService};

struct Echo;

impl WebService for Echo {
    fn invoke(&self, _: &MethodDescriptor, mut args: Vec<Value>) -> Result<Option<Value>, Exception> {
        Ok(args.pop())
    }
}

fn host(protocols: Vec<ProtocolKind>) -> ServiceHost {
    let descriptor = ServiceDescriptor::new("Echo").namespace("urn:echo").method(
        MethodBuilder::new("Say")
            .param(ParameterInfo::new("text", TypeTag::String))
            .returns(ReturnType::scalar(TypeTag::String)),
    );
    ServiceHost::new(descriptor, Arc::new(Echo), &Config::new().with_protocols(protocols)).unwrap()
}

fn raw(host: &ServiceHost, text: &str, is_local: bool) -> HttpResponse {
    let mut request = HttpRequest::try_from(text.as_bytes(), 1, is_local).unwrap();
    host.handle(&mut request)
}

fn body(response: &HttpResponse) -> String {
    String::from_utf8(response.content().to_vec()).unwrap()
}

fn soap11_request(body: &str) -> String {
    let envelope = format!(
        r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="{}"><soap:Body>{}</soap:Body></soap:Envelope>"#,
        SOAP11_ENVELOPE_NS, body
    );
    format!(
        "POST /Echo HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/xml; charset=utf-8\r\nSOAPAction: \"urn:echo/Say\"\r\nContent-Length: {}\r\n\r\n{}",
        envelope.len(),
        envelope
    )
}

#[test]
fn test_default_bindings_route_by_shape() {
    let host = host(ProtocolKind::defaults());

    let response = raw(&host, "GET /Echo/Say?text=hi HTTP/1.1\r\nHost: localhost\r\n\r\n", false);
    assert_eq!(response.status_code(), 200);
    assert!(body(&response).contains(">hi</string>"));

    let response = raw(&host, &soap11_request(r#"<Say xmlns="urn:echo"><text>hello</text></Say>"#), false);
    assert_eq!(response.status_code(), 200);
    assert!(response.content_type().unwrap().starts_with("text/xml"));
    assert!(body(&response).contains("<SayResult>hello</SayResult>"));
}

#[test]
fn test_soap_endpoint_rejects_get_with_allow() {
    let host = host(ProtocolKind::defaults());
    let response = raw(&host, "GET /Echo HTTP/1.1\r\n\r\n", true);
    assert_eq!(response.status_code(), 405);
    assert_eq!(response.allow(), Some(&[HttpRequestMethod::Post][..]));
    let wire = String::from_utf8(response.as_bytes()).unwrap();
    assert!(wire.contains("Allow: POST\r\n"));
}

#[test]
fn test_localhost_post_gate() {
    let host = host(ProtocolKind::defaults());
    let form = "POST /Echo/Say HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\ntext=ok";

    let response = raw(&host, form, true);
    assert_eq!(response.status_code(), 200);
    assert!(body(&response).contains(">ok</string>"));

    let response = raw(&host, form, false);
    assert_eq!(response.status_code(), 405);
    assert_eq!(response.allow(), Some(&[][..]));
}

#[test]
fn test_unbound_verb_is_not_found() {
    let host = host(ProtocolKind::defaults());
    assert_eq!(raw(&host, "PUT /Echo/Say HTTP/1.1\r\n\r\n", true).status_code(), 404);
    assert_eq!(raw(&host, "DELETE /Echo HTTP/1.1\r\n\r\n", true).status_code(), 404);
}

#[test]
fn test_merged_allow_across_bindings() {
    let host = host(vec![ProtocolKind::HttpPost, ProtocolKind::HttpGet]);
    let response = raw(&host, "HEAD /Echo/Say HTTP/1.1\r\n\r\n", true);
    assert_eq!(response.status_code(), 405);
    let allow = response.allow().unwrap();
    assert!(allow.contains(&HttpRequestMethod::Post));
    assert!(allow.contains(&HttpRequestMethod::Get));
}

#[test]
fn test_soap_unknown_content_type() {
    let host = host(ProtocolKind::defaults());
    let request = "POST /Echo HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
    assert_eq!(raw(&host, request, true).status_code(), 415);
}

#[test]
fn test_soap_version_mismatch_fault() {
    let host = host(ProtocolKind::defaults());
    let envelope = format!(
        r#"<e:Envelope xmlns:e="{}"><e:Body><Say xmlns="urn:echo"><text>x</text></Say></e:Body></e:Envelope>"#,
        SOAP12_ENVELOPE_NS
    );
    let request = format!(
        "POST /Echo HTTP/1.1\r\nContent-Type: text/xml\r\nSOAPAction: \"urn:echo/Say\"\r\nContent-Length: {}\r\n\r\n{}",
        envelope.len(),
        envelope
    );
    let response = raw(&host, &request, true);
    assert_eq!(response.status_code(), 500);
    assert!(body(&response).contains("VersionMismatch"));
}

#[test]
fn test_soap_routes_by_body_without_action() {
    let host = host(ProtocolKind::defaults());
    let request = soap11_request(r#"<Say xmlns="urn:echo"><text>body</text></Say>"#)
        .replace("SOAPAction: \"urn:echo/Say\"\r\n", "");
    let response = raw(&host, &request, true);
    assert_eq!(response.status_code(), 200);
    assert!(body(&response).contains("<SayResult>body</SayResult>"));
}

#[test]
fn test_soap_unknown_method_fault() {
    let host = host(ProtocolKind::defaults());
    let request = soap11_request(r#"<Shout xmlns="urn:echo"/>"#).replace("urn:echo/Say", "urn:echo/Shout");
    let response = raw(&host, &request, true);
    assert_eq!(response.status_code(), 500);
    assert!(body(&response).contains("soap:Client"));
}

#[test]
fn test_no_bindings_everything_not_found() {
    let host = host(vec![]);
    assert_eq!(raw(&host, "GET /Echo/Say?text=x HTTP/1.1\r\n\r\n", true).status_code(), 404);
}

#[test]
fn test_undecoded_request_encoding_is_client_fault() {
    let host = host(ProtocolKind::defaults());
    let envelope = format!(
        r#"<soap:Envelope xmlns:soap="{}"><soap:Body><Say xmlns="urn:echo"><text>zip</text></Say></soap:Body></soap:Envelope>"#,
        SOAP11_ENVELOPE_NS
    );
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(envelope.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let head = format!(
        "POST /Echo HTTP/1.1\r\nContent-Type: text/xml; charset=utf-8\r\nSOAPAction: \"urn:echo/Say\"\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
        compressed.len()
    );
    let mut wire = head.into_bytes();
    wire.extend_from_slice(&compressed);
    let mut request = HttpRequest::try_from(&wire, 1, true).unwrap();
    let response = host.handle(&mut request);

    assert_eq!(response.status_code(), 500);
    assert!(response.content_encoding().is_none());
    let text = body(&response);
    assert!(text.contains("soap:Client"));
    assert!(text.contains("gzip"));
}

use std::io::Write;

use std::sync::Arc;

use proptest::prelude::*;

use soapbind::formatter::parameter::{
    HtmlFormParameterReader, HtmlFormParameterWriter, ParameterReader, ParameterWriter, UrlParameterReader,
    UrlParameterWriter, ValueCollectionInit,
};
use soapbind::formatter::MimeFormatter;
use soapbind::stream::{BufferedOutputStream, OutputLayer, ResponseBody};
use soapbind::util::{parse_query, url_decode, url_encode, ByteEncoding};
use soapbind::{HttpRequest, HttpRequestMethod, MethodBuilder, ParameterInfo, ServiceDescriptor, TypeTag, Value};

fn latin1_string() -> impl Strategy<Value = String> {
    prop::collection::vec(0u8..=0xFF, 0..40).prop_map(|bytes| bytes.into_iter().map(char::from).collect())
}

fn mixed_method() -> Arc<ValueCollectionInit> {
    let service = ServiceDescriptor::new("S").method(
        MethodBuilder::new("M")
            .param(ParameterInfo::new("s", TypeTag::String))
            .param(ParameterInfo::array("v", TypeTag::String))
            .param(ParameterInfo::new("n", TypeTag::Int)),
    );
    Arc::new(ValueCollectionInit::build(&service.methods()[0]).unwrap())
}

fn arguments(label: &str, items: &[String], n: i64) -> Vec<Value> {
    vec![
        Value::Str(label.to_string()),
        Value::Array(items.iter().cloned().map(Value::Str).collect()),
        Value::Int(n),
    ]
}

proptest! {
    #[test]
    fn url_codec_round_trips_typed_arguments(
        label in ".{0,12}",
        items in prop::collection::vec(".{0,8}", 0..6),
        n in any::<i64>(),
        utf8 in any::<bool>(),
    ) {
        let init = mixed_method();
        let encoding = if utf8 { Some(ByteEncoding::Utf8) } else { None };
        let writer = UrlParameterWriter::initialize(init.clone()).with_encoding(encoding);
        let args = arguments(&label, &items, n);

        let url = writer.request_url("/S/M", &args).unwrap();
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        let occurrences = query.split('&').filter(|pair| pair.starts_with("v=")).count();
        prop_assert_eq!(occurrences, items.len());

        let mut request = HttpRequest::new(HttpRequestMethod::Get, &url);
        let decoded = UrlParameterReader::initialize(init).read(&mut request).unwrap().unwrap();
        prop_assert_eq!(decoded, args);
    }

    #[test]
    fn form_codec_round_trips_typed_arguments(
        label in ".{0,12}",
        items in prop::collection::vec(".{0,8}", 0..6),
        n in any::<i64>(),
    ) {
        let init = mixed_method();
        let writer = HtmlFormParameterWriter::initialize(init.clone());
        let args = arguments(&label, &items, n);

        let mut body = Vec::new();
        writer.write_request(&mut body, &args).unwrap();
        let text = String::from_utf8(body.clone()).unwrap();
        prop_assert_eq!(text.split('&').filter(|pair| pair.starts_with("v=")).count(), items.len());

        let mut request = HttpRequest::new(HttpRequestMethod::Post, "/S/M")
            .header_line("Content-Type", &writer.content_type().unwrap())
            .body(body);
        let decoded = HtmlFormParameterReader::initialize(init).read(&mut request).unwrap().unwrap();
        prop_assert_eq!(decoded, args);
    }

    #[test]
    fn utf8_escape_round_trips(text in ".*") {
        let encoded = url_encode(&text, Some(ByteEncoding::Utf8));
        prop_assert!(encoded.is_ascii());
        prop_assert_eq!(url_decode(&encoded, ByteEncoding::Utf8), text);
    }

    #[test]
    fn unicode_escape_round_trips(text in ".*") {
        let encoded = url_encode(&text, None);
        prop_assert!(encoded.is_ascii());
        prop_assert_eq!(url_decode(&encoded, ByteEncoding::Utf8), text);
    }

    #[test]
    fn latin1_escape_round_trips(text in latin1_string()) {
        let encoded = url_encode(&text, Some(ByteEncoding::Latin1));
        prop_assert_eq!(url_decode(&encoded, ByteEncoding::Latin1), text);
    }

    #[test]
    fn query_keeps_order_and_repeats(
        pairs in prop::collection::vec(("[a-c]{1,2}", ".{0,8}"), 0..12)
    ) {
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", url_encode(k, Some(ByteEncoding::Utf8)), url_encode(v, Some(ByteEncoding::Utf8))))
            .collect::<Vec<_>>()
            .join("&");
        let parsed = parse_query(&query, ByteEncoding::Utf8);
        prop_assert_eq!(&parsed, &pairs);

        for (name, _) in &pairs {
            let expected = pairs.iter().filter(|(k, _)| k == name).count();
            prop_assert_eq!(parsed.iter().filter(|(k, _)| k == name).count(), expected);
        }
    }

    #[test]
    fn buffered_stream_commits_every_byte(
        capacity in 1usize..64,
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..100), 0..20),
    ) {
        let body = ResponseBody::new();
        let mut out = Box::new(BufferedOutputStream::new(body.writer(), capacity));
        let mut expected = Vec::new();
        for chunk in &chunks {
            out.write_all(chunk).unwrap();
            expected.extend_from_slice(chunk);
            prop_assert!(out.buffered() <= capacity);
            prop_assert_eq!(body.len() + out.buffered(), expected.len());
        }
        out.close().unwrap();
        prop_assert!(body.is_closed());
        prop_assert_eq!(body.bytes().to_vec(), expected);
    }
}

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::{Span, SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue, global};

use crate::trace::{
    CarrierError, EgressSpan, EgressTracer, SpanContext, SpanOptions, TraceValue,
};

const INSTRUMENTATION_NAME: &str = "egress";

/// [`EgressTracer`] backed by the globally registered OpenTelemetry tracer
/// provider and text-map propagator.
pub struct OtelTracer {
    tracer: global::BoxedTracer,
}

impl std::fmt::Debug for OtelTracer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("OtelTracer").finish_non_exhaustive()
    }
}

impl OtelTracer {
    pub fn global() -> Self {
        Self {
            tracer: global::tracer(INSTRUMENTATION_NAME),
        }
    }
}

impl Default for OtelTracer {
    fn default() -> Self {
        Self::global()
    }
}

struct OtelSpan {
    span: global::BoxedSpan,
}

fn key_value(key: &str, value: &TraceValue) -> KeyValue {
    match value {
        TraceValue::Str(text) => KeyValue::new(key.to_owned(), text.clone()),
        TraceValue::Bool(flag) => KeyValue::new(key.to_owned(), *flag),
        TraceValue::I64(number) => KeyValue::new(key.to_owned(), *number),
        TraceValue::U64(number) => {
            KeyValue::new(key.to_owned(), i64::try_from(*number).unwrap_or(i64::MAX))
        }
    }
}

impl EgressTracer for OtelTracer {
    fn start_span(&self, name: &str, options: &SpanOptions) -> Box<dyn EgressSpan> {
        let attributes = options
            .tags()
            .iter()
            .map(|(key, value)| key_value(key, value))
            .collect::<Vec<_>>();
        let span = self
            .tracer
            .span_builder(name.to_owned())
            .with_kind(SpanKind::Client)
            .with_attributes(attributes)
            .start(&self.tracer);
        Box::new(OtelSpan { span })
    }

    fn extract(&self, headers: &HeaderMap) -> Result<SpanContext, CarrierError> {
        let context = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(headers))
        });
        let span_context = context.span().span_context().clone();
        if !span_context.is_valid() {
            return Err(CarrierError::NotFound);
        }
        Ok(SpanContext::new(
            span_context.trace_id().to_string(),
            span_context.span_id().to_string(),
        ))
    }
}

impl EgressSpan for OtelSpan {
    fn log_fields(&mut self, fields: &[(&str, TraceValue)]) {
        let name = fields
            .iter()
            .find(|(key, _)| *key == "event")
            .map(|(_, value)| value.to_string())
            .unwrap_or_else(|| "log".to_owned());
        let attributes = fields
            .iter()
            .filter(|(key, _)| *key != "event")
            .map(|(key, value)| key_value(key, value))
            .collect();
        self.span.add_event(name, attributes);
    }

    fn set_tag(&mut self, key: &str, value: TraceValue) {
        self.span.set_attribute(key_value(key, &value));
    }

    fn inject(&self, headers: &mut HeaderMap) -> Result<(), CarrierError> {
        let context = Context::new().with_remote_span_context(self.span.span_context().clone());
        let mut injector = HeaderInjector {
            headers,
            error: None,
        };
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&context, &mut injector);
        });
        match injector.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn context(&self) -> Option<SpanContext> {
        let span_context = self.span.span_context();
        span_context.is_valid().then(|| {
            SpanContext::new(
                span_context.trace_id().to_string(),
                span_context.span_id().to_string(),
            )
        })
    }

    fn finish(mut self: Box<Self>) {
        self.span.end();
    }
}

struct HeaderInjector<'a> {
    headers: &'a mut HeaderMap,
    error: Option<CarrierError>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(error) => {
                self.error.get_or_insert(CarrierError::InvalidHeader {
                    name: key.to_owned(),
                    message: error.to_string(),
                });
                return;
            }
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(error) => {
                self.error.get_or_insert(CarrierError::InvalidHeader {
                    name: key.to_owned(),
                    message: error.to_string(),
                });
            }
        }
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use super::{HeaderInjector, OtelTracer, key_value};
    use crate::trace::{CarrierError, EgressSpan, EgressTracer, SpanOptions, TraceValue};
    use opentelemetry::propagation::Injector;

    #[test]
    fn unsigned_values_saturate_into_i64_attributes() {
        let attribute = key_value("http.attempt_count", &TraceValue::U64(u64::MAX));
        assert_eq!(attribute.key.as_str(), "http.attempt_count");
        assert_eq!(attribute.value.to_string(), i64::MAX.to_string());
    }

    #[test]
    fn injector_reports_invalid_header_names() {
        let mut headers = HeaderMap::new();
        let mut injector = HeaderInjector {
            headers: &mut headers,
            error: None,
        };
        injector.set("bad header", "value".to_owned());
        injector.set("traceparent", "00-abc".to_owned());
        assert!(matches!(
            injector.error,
            Some(CarrierError::InvalidHeader { .. })
        ));
        assert!(headers.contains_key("traceparent"));
    }

    #[test]
    fn spans_without_a_provider_have_no_context() {
        let tracer = OtelTracer::global();
        let span = tracer.start_span("HTTP Egress", &SpanOptions::new());
        assert_eq!(span.context(), None);
        span.finish();
    }

    #[test]
    fn extraction_without_headers_finds_nothing() {
        let tracer = OtelTracer::global();
        assert!(matches!(
            tracer.extract(&HeaderMap::new()),
            Err(CarrierError::NotFound)
        ));
    }
}

use std::error::Error as StdError;
use std::sync::Mutex;

use http::Uri;

use crate::error::{BoxError, TransportErrorKind};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn redact_uri_for_logs(uri: &Uri) -> String {
    let uri_text = uri.to_string();
    let Ok(mut parsed) = url::Url::parse(&uri_text) else {
        return uri_text.split('?').next().unwrap_or(&uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn classify_transport_error(error: &BoxError) -> TransportErrorKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(&**error);
    while let Some(source) = current {
        if let Some(hyper_error) = source.downcast_ref::<hyper_util::client::legacy::Error>() {
            return classify_hyper_error(hyper_error);
        }
        if let Some(io_error) = source.downcast_ref::<std::io::Error>() {
            return classify_io_error(io_error);
        }
        current = source.source();
    }
    TransportErrorKind::Other
}

fn classify_hyper_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let text = error_chain_text(error);
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("connection closed")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

fn classify_io_error(error: &std::io::Error) -> TransportErrorKind {
    use std::io::ErrorKind;

    match error.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::NotConnected => {
            TransportErrorKind::Connect
        }
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
            TransportErrorKind::Read
        }
        _ => TransportErrorKind::Other,
    }
}

fn error_chain_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut current = error.source();
    while let Some(source) = current {
        text.push_str(": ");
        text.push_str(&source.to_string().to_ascii_lowercase());
        current = source.source();
    }
    text
}

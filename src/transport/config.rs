//! Parsing helpers for `--engine` and repeatable `--connect KEY=VALUE` flags.

use std::collections::BTreeMap;

use super::Engine;

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub params: BTreeMap<String, String>,
}

pub fn parse_engine(s: &str) -> Option<Engine> {
    match s.to_ascii_lowercase().as_str() {
        "amqp" | "rabbitmq" | "rabbit" => Some(Engine::Amqp),
        #[cfg(any(test, feature = "transport-mock"))]
        "mock" => Some(Engine::Mock),
        _ => None,
    }
}

/// Collects `KEY=VALUE` pairs. Entries without `=` are ignored; later keys win.
pub fn parse_connect_kv(pairs: &[String]) -> ConnectOptions {
    let mut opts = ConnectOptions::default();
    for pair in pairs {
        if let Some((k, v)) = pair.split_once('=') {
            let k = k.trim();
            if !k.is_empty() {
                opts.params.insert(k.to_string(), v.trim().to_string());
            }
        }
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_pairs_win_and_junk_is_skipped() {
        let opts = parse_connect_kv(&[
            "host=a".to_string(),
            "noequals".to_string(),
            "host=b".to_string(),
            " port = 1 ".to_string(),
        ]);
        assert_eq!(opts.params.get("host").map(String::as_str), Some("b"));
        assert_eq!(opts.params.get("port").map(String::as_str), Some("1"));
        assert_eq!(opts.params.len(), 2);
    }

    #[test]
    fn engine_names() {
        assert_eq!(parse_engine("AMQP"), Some(Engine::Amqp));
        assert_eq!(parse_engine("rabbitmq"), Some(Engine::Amqp));
        assert_eq!(parse_engine("mock"), Some(Engine::Mock));
        assert_eq!(parse_engine("kafka"), None);
    }
}

use std::str::FromStr;

use anyhow::Context;

/// Parses a single `key=value` pair. Only the first `=` separates the key from
/// the value, so values may themselves contain `=` (eg base64 padding).
pub fn parse_key_value<K, V, Output>(s: &str) -> anyhow::Result<Output>
where
    K: FromStr<Err: Send + Sync + 'static>,
    V: FromStr<Err: Send + Sync + 'static>,
    Output: TryFrom<(K, V)>,
    anyhow::Error: From<<Output as TryFrom<(K, V)>>::Error>
        + From<<K as FromStr>::Err>
        + From<<V as FromStr>::Err>,
{
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid key=value: no `=` found in `{s}`"))?;
    Ok((
        key.trim()
            .parse()
            .map_err(anyhow::Error::from)
            .with_context(|| format!("Failed to parse key {key}"))?,
        value
            .parse()
            .map_err(anyhow::Error::from)
            .with_context(|| format!("Failed to parse value for key {key}"))?,
    )
        .try_into()?)
}

/// Parses a `separator`-delimited list of `key=value` pairs, skipping empty
/// segments such as the one produced by a trailing separator.
pub fn parse_key_value_list(s: &str, separator: char) -> anyhow::Result<Vec<(String, String)>> {
    s.split(separator)
        .filter(|segment| !segment.trim().is_empty())
        .map(parse_key_value::<String, String, (String, String)>)
        .collect()
}

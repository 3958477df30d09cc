pub mod hive;
pub mod kyuubi;
pub mod spark;

use std::collections::BTreeMap;

use product_config::writer::{to_java_properties_string, PropertiesWriterError};
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to write {file}"))]
    WriteProperties {
        source: PropertiesWriterError,
        file: &'static str,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Drops keys whose value is absent or blank.
fn without_blanks(
    properties: BTreeMap<String, Option<String>>,
) -> BTreeMap<String, Option<String>> {
    properties
        .into_iter()
        .filter(|(_, value)| value.as_deref().is_some_and(|value| !value.is_empty()))
        .collect()
}

/// Renders a `.properties` file with sorted keys, omitting blank values.
pub fn to_properties(
    file: &'static str,
    properties: BTreeMap<String, Option<String>>,
) -> Result<String> {
    to_java_properties_string(without_blanks(properties).iter())
        .context(WritePropertiesSnafu { file })
}

/// Reads back rendered properties, undoing the writer's escaping.
#[cfg(test)]
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    fn unescape(raw: &str) -> String {
        let mut out = String::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match (c, chars.clone().next()) {
                ('\\', Some(next)) => {
                    chars.next();
                    out.push(next);
                }
                _ => out.push(c),
            }
        }
        out
    }

    let mut properties = BTreeMap::new();
    for line in text.lines().filter(|line| !line.starts_with('#')) {
        let mut split_at = None;
        let mut escaped = false;
        for (index, c) in line.char_indices() {
            match c {
                '\\' if !escaped => escaped = true,
                '=' if !escaped => {
                    split_at = Some(index);
                    break;
                }
                _ => escaped = false,
            }
        }
        if let Some(index) = split_at {
            properties.insert(unescape(&line[..index]), unescape(&line[index + 1..]));
        }
    }
    properties
}

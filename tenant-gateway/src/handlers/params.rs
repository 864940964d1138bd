//! Ordered query-string parameters.
//!
//! Prometheus endpoints accept repeated keys (`match[]`), so parameters are
//! kept as an ordered list of pairs rather than a map.

use service_core::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// Decode a raw (percent-encoded) query string.
    pub fn parse(raw: Option<&str>) -> Result<Self, AppError> {
        let pairs = match raw {
            Some(raw) if !raw.is_empty() => serde_urlencoded::from_str(raw).map_err(|e| {
                AppError::BadRequest(anyhow::anyhow!("invalid query string: {}", e))
            })?,
            _ => Vec::new(),
        };
        Ok(Self(pairs))
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k == name)
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of `name` with a single value, keeping the
    /// position of the first occurrence.
    pub fn set(&mut self, name: &str, value: String) {
        match self.0.iter().position(|(k, _)| k == name) {
            Some(first) => {
                self.0[first].1 = value;
                let mut index = 0;
                self.0.retain(|(k, _)| {
                    let keep = index <= first || k != name;
                    index += 1;
                    keep
                });
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    /// Apply `f` to every value of `name`, failing on the first error.
    pub fn try_map_all<F, E>(&mut self, name: &str, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str) -> Result<String, E>,
    {
        for (key, value) in self.0.iter_mut() {
            if key == name {
                *value = f(value)?;
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> String {
        // Serializing a slice of string pairs cannot fail.
        serde_urlencoded::to_string(&self.0).unwrap_or_default()
    }
}

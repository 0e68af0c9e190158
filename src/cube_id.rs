//! Data cube identity.
//!
//! A cube id is `<name>_<resolution>` for the irregular (per-scene) cube and
//! `<name>_<resolution>_<step><unit>_<function>` for a composite cube, e.g.
//! `mycube_10_16D_STK`. The first two segments identify the irregular cube
//! shared by every composite derived from the same scenes.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{CubeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeId {
    pub name: String,
    pub resolution: u32,
    /// Temporal label, e.g. `16D` or `1M`. `None` for the irregular cube.
    pub temporal: Option<String>,
    /// Composite function, e.g. `STK`, `MED`. `None` for the irregular cube.
    pub function: Option<String>,
}

fn cube_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9]+(?:-[A-Za-z0-9]+)*)_(\d+)(?:_(\d+[DMY])_([A-Z]+))?$")
            .unwrap()
    })
}

impl CubeId {
    pub fn parse(id: &str) -> Result<Self> {
        let caps = cube_id_re()
            .captures(id)
            .ok_or_else(|| CubeError::Validation(format!("malformed cube id '{id}'")))?;
        Ok(CubeId {
            name: caps[1].to_string(),
            resolution: caps[2]
                .parse()
                .map_err(|_| CubeError::Validation(format!("bad resolution in '{id}'")))?,
            temporal: caps.get(3).map(|m| m.as_str().to_string()),
            function: caps.get(4).map(|m| m.as_str().to_string()),
        })
    }

    pub fn is_identity(&self) -> bool {
        match self.function.as_deref() {
            None | Some("IDENTITY") => true,
            Some(_) => false,
        }
    }

    /// The `<name>_<resolution>` id of the irregular cube this cube derives from.
    pub fn irregular(&self) -> String {
        format!("{}_{}", self.name, self.resolution)
    }

    pub fn full(&self) -> String {
        match (&self.temporal, &self.function) {
            (Some(t), Some(f)) => format!("{}_{}_{}_{}", self.name, self.resolution, t, f),
            _ => self.irregular(),
        }
    }

    /// Canonical composite id for a temporal schema + function pair.
    pub fn composite(name: &str, resolution: u32, temporal: &str, function: &str) -> String {
        format!("{name}_{resolution}_{temporal}_{function}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_composite_id() {
        let id = CubeId::parse("mycube_10_16D_STK").unwrap();
        assert_eq!(id.name, "mycube");
        assert_eq!(id.resolution, 10);
        assert_eq!(id.temporal.as_deref(), Some("16D"));
        assert_eq!(id.function.as_deref(), Some("STK"));
        assert!(!id.is_identity());
        assert_eq!(id.irregular(), "mycube_10");
        assert_eq!(id.full(), "mycube_10_16D_STK");
    }

    #[test]
    fn parse_irregular_id() {
        let id = CubeId::parse("mycube_64").unwrap();
        assert_eq!(id.resolution, 64);
        assert!(id.temporal.is_none());
        assert!(id.is_identity());
        assert_eq!(id.full(), "mycube_64");
    }

    #[test]
    fn parse_monthly_id() {
        let id = CubeId::parse("c4-64_64_1M_MED").unwrap();
        assert_eq!(id.name, "c4-64");
        assert_eq!(id.temporal.as_deref(), Some("1M"));
        assert_eq!(id.function.as_deref(), Some("MED"));
    }

    #[test]
    fn reject_malformed() {
        assert!(CubeId::parse("nounderscore").is_err());
        assert!(CubeId::parse("cube_ten").is_err());
        assert!(CubeId::parse("cube_10_16D").is_err());
    }
}

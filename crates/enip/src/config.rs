//! Configuration-file loading: a `[Simulator]` section defining tags,
//! one `name[@class/instance/attribute] = TYPE[len] [= v,v,…]` per line.

use cip::symbol::{parse_definition, TagDef};

/// Parse the `[Simulator]` section of a configuration text. Lines
/// outside the section, blank lines and `#`/`;` comments are ignored.
pub fn parse_simulator(text: &str) -> anyhow::Result<Vec<TagDef>> {
    use anyhow::Context;

    let mut defs = Vec::new();
    let mut in_simulator = false;
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_simulator = section.eq_ignore_ascii_case("simulator");
            continue;
        }
        if !in_simulator {
            continue;
        }
        let (name, rest) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected name = TYPE", number + 1))?;
        let def = parse_definition(&format!("{}={}", name.trim(), rest.trim()))
            .with_context(|| format!("line {}: bad tag definition", number + 1))?;
        defs.push(def);
    }
    Ok(defs)
}

#[cfg(test)]
mod test {
    use super::*;
    use cip::CipType;
    use dict::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simulator_section() {
        let text = r#"
# A simulator profile.
[Server]
port = 44818

[Simulator]
SCADA      = INT[1000]
number     = REAL = 1.25
Motor@0x93/3/10 = DINT = 1,2,3
; trailing comment
"#;
        let defs = parse_simulator(text).unwrap();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].spec.name.as_deref(), Some("SCADA"));
        assert_eq!(defs[0].ty, CipType::Int);
        assert_eq!(defs[0].length, 1000);
        assert_eq!(defs[1].values, vec![Value::Real(1.25)]);
        assert_eq!(defs[2].spec.address, Some((0x93, 3, Some(10), None)));
    }

    #[test]
    fn test_bad_line() {
        assert!(parse_simulator("[Simulator]\nnot a definition\n").is_err());
    }
}

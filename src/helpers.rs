use std::collections::BTreeMap;

// ── Operator defaults (injected via CLI flags / env) ──────────────────────────

pub const DEFAULT_IMAGE_REPOSITORY: &str = "registry.k8s.io/ingress-nginx/controller";
pub const DEFAULT_IMAGE_TAG: &str = "v1.3.0";
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";

/// Cluster-specific configuration injected at startup via CLI flags.
/// Handed to the normalizer on every reconcile to fill unset spec fields.
#[derive(Clone, Debug)]
pub struct OperatorDefaults {
    pub image_repository: String,
    pub image_tag: String,
    pub ingress_class: String,
}

impl Default for OperatorDefaults {
    fn default() -> Self {
        Self {
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
        }
    }
}

// ── Naming helpers ────────────────────────────────────────────────────────────

/// Full image reference from repository and tag.
pub fn generate_image(repository: &str, tag: &str) -> String {
    format!("{repository}:{tag}")
}

/// Overlay `extra` on top of `base`. Keys present in both take the value from `extra`.
pub fn merge_labels(
    base: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// `None` for an empty map, so that generated objects omit the field the
/// same way the API server returns it.
pub fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Treat a blank string the same as an absent one.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ── Resource quantities ───────────────────────────────────────────────────────

/// Parse a Kubernetes resource quantity into nano-units, so that `"1"`,
/// `"1000m"` and `"1e3m"` all compare equal.
///
/// Supports decimal SI suffixes (n, u, m, k, M, G, T, P, E), binary suffixes
/// (Ki .. Ei) and decimal exponents (`1e3`). Precision below one nano-unit is
/// truncated.
pub fn parse_quantity(s: &str) -> Result<i128, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty quantity".to_string());
    }

    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => (-1i128, rest),
        None => (1i128, s.strip_prefix('+').unwrap_or(s)),
    };

    let num_end = body
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(body.len());
    let (num_str, suffix) = body.split_at(num_end);

    let (int_part, frac_part) = num_str.split_once('.').unwrap_or((num_str, ""));
    if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
        return Err(format!("invalid number {num_str:?}"));
    }

    let digits = format!("{int_part}{frac_part}");
    let mut value: i128 = digits
        .parse()
        .map_err(|e| format!("invalid number {num_str:?}: {e}"))?;
    let mut exp10 = -(frac_part.len() as i32);
    let mut exp2 = 0u32;

    match suffix {
        "" => {}
        "n" => exp10 -= 9,
        "u" => exp10 -= 6,
        "m" => exp10 -= 3,
        "k" => exp10 += 3,
        "M" => exp10 += 6,
        "G" => exp10 += 9,
        "T" => exp10 += 12,
        "P" => exp10 += 15,
        "E" => exp10 += 18,
        "Ki" => exp2 = 10,
        "Mi" => exp2 = 20,
        "Gi" => exp2 = 30,
        "Ti" => exp2 = 40,
        "Pi" => exp2 = 50,
        "Ei" => exp2 = 60,
        other if other.starts_with(['e', 'E']) => {
            let exp = other[1..]
                .parse::<i32>()
                .map_err(|e| format!("invalid exponent {other:?}: {e}"))?;
            exp10 = exp10
                .checked_add(exp)
                .ok_or_else(|| format!("exponent {other:?} out of range"))?;
        }
        other => return Err(format!("unknown suffix {other:?}")),
    }

    let out_of_range = || format!("quantity {s:?} out of range");
    // Scale to nano-units.
    exp10 = exp10.checked_add(9).ok_or_else(out_of_range)?;

    value = value.checked_mul(1i128 << exp2).ok_or_else(out_of_range)?;
    if exp10 >= 0 {
        let factor = 10i128.checked_pow(exp10 as u32).ok_or_else(out_of_range)?;
        value = value.checked_mul(factor).ok_or_else(out_of_range)?;
    } else {
        value = match 10i128.checked_pow(exp10.unsigned_abs()) {
            Some(divisor) => value / divisor,
            None => 0,
        };
    }

    Ok(sign * value)
}

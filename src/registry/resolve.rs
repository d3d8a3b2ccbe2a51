//! Datum resolution for downstream consumers.
//!
//! Turns a datum id back into the file that holds its frame. Registration
//! happens before the frame exists, so the returned path may not exist yet;
//! it is guaranteed to once the hardware writer catches up.

use std::path::PathBuf;

use super::{
    DatumId, RegistryError, RegistryResult, Resource, ResourceRegistry, SPEC_AD_EIGER2,
    SPEC_AD_TIFF,
};

/// Path of the file holding `datum_id`.
///
/// - `AD_EIGER2`: `{resource_path}_{seq_id}_master.h5`
/// - `AD_TIFF`: the resource `template` rendered with
///   `(root, filename, point_number)`
pub async fn resolve_datum(
    registry: &dyn ResourceRegistry,
    datum_id: &DatumId,
) -> RegistryResult<PathBuf> {
    let datum = registry
        .datum(datum_id)
        .await?
        .ok_or_else(|| RegistryError::UnknownDatum(datum_id.clone()))?;
    let resource = registry
        .resource(&datum.resource)
        .await?
        .ok_or_else(|| RegistryError::UnknownResource(datum.resource.clone()))?;

    match resource.spec.as_str() {
        SPEC_AD_EIGER2 => {
            let seq_id = datum
                .param_u64("seq_id")
                .ok_or_else(|| missing(&resource, "seq_id"))?;
            Ok(PathBuf::from(format!(
                "{}_{}_master.h5",
                resource.resource_path.display(),
                seq_id
            )))
        }
        SPEC_AD_TIFF => {
            let point = datum
                .param_u64("point_number")
                .ok_or_else(|| missing(&resource, "point_number"))?;
            let template = resource
                .params
                .get("template")
                .and_then(|v| v.as_str())
                .ok_or_else(|| missing(&resource, "template"))?;
            let filename = resource
                .params
                .get("filename")
                .and_then(|v| v.as_str())
                .ok_or_else(|| missing(&resource, "filename"))?;
            let root = resource.root.display().to_string();
            render_file_template(template, &[&root, filename], point)
                .map(PathBuf::from)
                .ok_or_else(|| {
                    RegistryError::Rejected(format!("unsupported file template '{template}'"))
                })
        }
        other => Err(RegistryError::Rejected(format!(
            "no handler for resource spec '{other}'"
        ))),
    }
}

fn missing(resource: &Resource, key: &str) -> RegistryError {
    RegistryError::Rejected(format!(
        "resource '{}' ({}) has no '{}' parameter",
        resource.id, resource.spec, key
    ))
}

/// Render an areaDetector file template such as `%s%s_%6.6d.tiff`.
///
/// Supports `%s` (consumes `strings` in order), `%d` with optional width and
/// precision (zero padding to the precision) and `%%`.
pub fn render_file_template(template: &str, strings: &[&str], number: u64) -> Option<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut strings = strings.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == '.' {
                spec.push(next);
                chars.next();
            } else {
                break;
            }
        }
        match chars.next()? {
            '%' => out.push('%'),
            's' => out.push_str(strings.next()?),
            'd' => {
                let (width, precision) = match spec.split_once('.') {
                    Some((w, p)) => (w.parse().unwrap_or(0), p.parse().unwrap_or(0)),
                    None => (spec.parse().unwrap_or(0), 0),
                };
                let digits = format!("{number:0precision$}");
                out.push_str(&format!("{digits:>width$}"));
            }
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Datum, InMemoryRegistry, Resource};

    #[test]
    fn test_render_tiff_template() {
        assert_eq!(
            render_file_template("%s%s_%6.6d.tiff", &["/d/", "abc"], 7).as_deref(),
            Some("/d/abc_000007.tiff")
        );
        assert_eq!(
            render_file_template("%s_%d", &["x"], 12).as_deref(),
            Some("x_12")
        );
        assert_eq!(render_file_template("%s%s", &["only-one"], 0), None);
        assert_eq!(render_file_template("%q", &[], 0), None);
    }

    #[tokio::test]
    async fn test_resolve_eiger_master_file() {
        let registry = InMemoryRegistry::new();
        let res = registry
            .insert_resource(Resource::new(SPEC_AD_EIGER2, "/d/2024/", "/d/2024/abc"))
            .await
            .unwrap();
        let datum = Datum::new(&res).with_param("seq_id", 2u64);
        let id = datum.id.clone();
        registry.insert_datum(datum).await.unwrap();

        let path = resolve_datum(&registry, &id).await.unwrap();
        assert_eq!(path, PathBuf::from("/d/2024/abc_2_master.h5"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_datum() {
        let registry = InMemoryRegistry::new();
        let err = resolve_datum(&registry, &DatumId::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDatum(_)));
    }
}

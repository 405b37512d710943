//! Node identifier helpers.
//!
//! Identifiers look like `module.a.module.b.aws_instance.web~2`: an optional
//! dotted module path, `type.name`, and an optional `~N` instance suffix.

/// Separator between a base identifier and its instance number.
pub const SUFFIX_SEPARATOR: char = '~';

/// Borrowed view of an identifier's parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId<'a> {
    pub module: &'a str,
    pub resource_type: &'a str,
    pub name: &'a str,
    pub suffix: Option<usize>,
}

impl<'a> NodeId<'a> {
    pub fn parse(id: &'a str) -> Self {
        let (base, suffix) = split_suffix(id);
        let (module, local) = split_module(base);
        let (resource_type, name) = match local.find('.') {
            Some(dot) => (&local[..dot], &local[dot + 1..]),
            None => (local, ""),
        };
        Self {
            module,
            resource_type,
            name,
            suffix,
        }
    }
}

/// Split `x~3` into (`x`, Some(3)). Anything after `~` that is not a number
/// is treated as part of the base.
pub fn split_suffix(id: &str) -> (&str, Option<usize>) {
    if let Some(pos) = id.rfind(SUFFIX_SEPARATOR) {
        if let Ok(n) = id[pos + 1..].parse::<usize>() {
            return (&id[..pos], Some(n));
        }
    }
    (id, None)
}

/// Split the module prefix off an identifier: `module.a.aws_vpc.main`
/// becomes (`module.a`, `aws_vpc.main`).
pub fn split_module(id: &str) -> (&str, &str) {
    let mut rest = id;
    let mut module_end = 0;
    while let Some(after) = rest.strip_prefix("module.") {
        match after.find('.') {
            // A module segment must be followed by at least `type.name`.
            Some(dot) if after[dot + 1..].contains('.') => {
                module_end += "module.".len() + dot + 1;
                rest = &after[dot + 1..];
            }
            _ => break,
        }
    }
    if module_end == 0 {
        ("", id)
    } else {
        (&id[..module_end - 1], &id[module_end..])
    }
}

/// Identifier without its instance suffix.
pub fn base(id: &str) -> &str {
    split_suffix(id).0
}

pub fn suffix(id: &str) -> Option<usize> {
    split_suffix(id).1
}

pub fn with_suffix(base: &str, n: usize) -> String {
    format!("{}{}{}", base, SUFFIX_SEPARATOR, n)
}

pub fn resource_type(id: &str) -> &str {
    NodeId::parse(id).resource_type
}

/// Full identifier for `type.name` declared in `module` (empty = root).
pub fn qualified(module: &str, resource_type: &str, name: &str) -> String {
    if module.is_empty() {
        format!("{}.{}", resource_type, name)
    } else {
        format!("{}.{}.{}", module, resource_type, name)
    }
}

/// Provider tag of a resource type: the part before the first underscore.
pub fn provider_prefix(resource_type: &str) -> &str {
    match resource_type.find('_') {
        Some(pos) => &resource_type[..pos],
        None => resource_type,
    }
}

/// Reduce arbitrary text to an identifier-safe name segment.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_identifier() {
        let id = NodeId::parse("aws_instance.web");
        assert_eq!(id.module, "");
        assert_eq!(id.resource_type, "aws_instance");
        assert_eq!(id.name, "web");
        assert_eq!(id.suffix, None);
    }

    #[test]
    fn test_parse_nested_module_with_suffix() {
        let id = NodeId::parse("module.net.module.sub.aws_subnet.private~12");
        assert_eq!(id.module, "module.net.module.sub");
        assert_eq!(id.resource_type, "aws_subnet");
        assert_eq!(id.name, "private");
        assert_eq!(id.suffix, Some(12));
    }

    #[test]
    fn test_resource_named_module_is_not_a_prefix() {
        // `module.x` alone cannot be a module prefix: nothing follows it.
        let (module, local) = split_module("module.x");
        assert_eq!(module, "");
        assert_eq!(local, "module.x");
    }

    #[test]
    fn test_non_numeric_suffix_is_part_of_base() {
        assert_eq!(split_suffix("aws_vpc.main~x"), ("aws_vpc.main~x", None));
        assert_eq!(split_suffix("aws_vpc.main~3"), ("aws_vpc.main", Some(3)));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("us-east-1a"), "us_east_1a");
        assert_eq!(sanitize("  Shared  Services "), "shared_services");
    }

    #[test]
    fn test_provider_prefix() {
        assert_eq!(provider_prefix("aws_instance"), "aws");
        assert_eq!(provider_prefix("azurerm_subnet"), "azurerm");
        assert_eq!(provider_prefix("random"), "random");
    }
}

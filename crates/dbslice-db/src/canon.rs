//! Textual canonicalization and schema-qualifier rewriting for index,
//! constraint, trigger, and function definitions.
//!
//! All of this is regex-based textual substitution, mirroring the source
//! system's approach, rather than catalog-driven reconstruction — see the
//! design notes on schema-qualifier rewriting for the known limitation this
//! carries (dotted or unusually-quoted identifiers can be miscanonicalized).

use std::sync::OnceLock;

use regex::Regex;

fn on_clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\bON\s+(?:"?[A-Za-z_][\w$]*"?\.)?"?([A-Za-z_][\w$]*)"?"#).unwrap())
}

fn index_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\bINDEX\s+(?:IF NOT EXISTS\s+)?"?([A-Za-z_][\w$]*)"?\s+ON"#).unwrap())
}

fn execute_function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bEXECUTE\s+(?:FUNCTION|PROCEDURE)\s+(?:"?[A-Za-z_][\w$]*"?\.)?"?([A-Za-z_][\w$]*)"?"#)
            .unwrap()
    })
}

fn references_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bREFERENCES\s+(?:"?[A-Za-z_][\w$]*"?\.)?"?([A-Za-z_][\w$]*)"?"#).unwrap()
    })
}

fn schema_qualifier_re(schema: &str) -> Regex {
    Regex::new(&format!(r#"(?i)\b{}\."#, regex::escape(schema))).unwrap()
}

/// Collapse consecutive whitespace into single spaces and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrite every `source_schema.` qualifier in `text` to `dest_schema.`.
pub fn requalify_schema(text: &str, source_schema: &str, dest_schema: &str) -> String {
    schema_qualifier_re(source_schema)
        .replace_all(text, format!("{dest_schema}."))
        .into_owned()
}

/// Canonical form of a constraint definition for drift comparison:
/// whitespace-collapsed, schema-requalified, and (for foreign keys)
/// `NOT VALID`-stripped.
pub fn canonical_constraint_def(def: &str, source_schema: &str, dest_schema: &str, is_fk: bool) -> String {
    let mut text = collapse_whitespace(def);
    if is_fk {
        text = text.replace(" NOT VALID", "");
        text = requalify_references(&text, dest_schema);
    }
    requalify_schema(&text, source_schema, dest_schema)
}

/// Rewrite `REFERENCES [schema.]table` to `REFERENCES "dest_schema"."table"`.
pub fn requalify_references(def: &str, dest_schema: &str) -> String {
    references_re()
        .replace(def, |caps: &regex::Captures| {
            format!("REFERENCES \"{}\".\"{}\"", dest_schema, &caps[1])
        })
        .into_owned()
}

/// Prepare a source index definition for execution against the destination:
/// rewrite the `ON schema.table` qualifier, force the explicit index name
/// (so `IF NOT EXISTS` cannot silently pick a different name), and inject
/// `IF NOT EXISTS`.
pub fn rewrite_index_def_for_dest(def: &str, source_schema: &str, dest_schema: &str, name: &str) -> String {
    let mut text = on_clause_re()
        .replace(def, format!("ON \"{dest_schema}\".\"$1\""))
        .into_owned();
    text = requalify_schema(&text, source_schema, dest_schema);

    if !text.to_uppercase().contains("IF NOT EXISTS") {
        text = index_name_re()
            .replace(&text, format!("INDEX IF NOT EXISTS \"{name}\" ON"))
            .into_owned();
    }
    text
}

/// Normalized form of an index definition for drift comparison: whitespace
/// collapsed and schema-requalified, ignoring `IF NOT EXISTS` presence.
pub fn canonical_index_def(def: &str, source_schema: &str, dest_schema: &str) -> String {
    let text = collapse_whitespace(def);
    let text = text.replace("IF NOT EXISTS ", "");
    requalify_schema(&text, source_schema, dest_schema)
}

/// Prepare a source trigger definition for execution against the
/// destination: rewrite the `ON schema.table` clause and the
/// `EXECUTE FUNCTION schema.fn` clause.
pub fn rewrite_trigger_def_for_dest(def: &str, source_schema: &str, dest_schema: &str) -> String {
    let text = on_clause_re()
        .replace(def, format!("ON \"{dest_schema}\".\"$1\""))
        .into_owned();
    let text = execute_function_re()
        .replace(&text, format!("EXECUTE FUNCTION \"{dest_schema}\".\"$1\""))
        .into_owned();
    requalify_schema(&text, source_schema, dest_schema)
}

/// Rewrite a source function definition for execution against the
/// destination: `CREATE FUNCTION` becomes `CREATE OR REPLACE FUNCTION`, and
/// every `source_schema.` qualifier becomes `dest_schema.`.
pub fn rewrite_function_def_for_dest(def: &str, source_schema: &str, dest_schema: &str) -> String {
    let text = def.replacen("CREATE FUNCTION", "CREATE OR REPLACE FUNCTION", 1);
    requalify_schema(&text, source_schema, dest_schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace() {
        assert_eq!(collapse_whitespace("a   b\n\tc"), "a b c");
    }

    #[test]
    fn requalifies_schema_occurrences() {
        let text = "CHECK (public.orders.status = 1)";
        assert_eq!(
            requalify_schema(text, "public", "stage"),
            "CHECK (stage.orders.status = 1)"
        );
    }

    #[test]
    fn strips_not_valid_for_fk_canonicalization() {
        let def = "FOREIGN KEY (order_id) REFERENCES public.orders(id) NOT VALID";
        let canon = canonical_constraint_def(def, "public", "stage", true);
        assert!(!canon.contains("NOT VALID"));
        assert!(canon.contains("\"stage\".\"orders\""));
    }

    #[test]
    fn rewrites_index_on_clause_and_forces_name() {
        let def = "CREATE INDEX idx_orders_status ON public.orders USING btree (status)";
        let rewritten = rewrite_index_def_for_dest(def, "public", "stage", "idx_orders_status");
        assert!(rewritten.contains("ON \"stage\".\"orders\""));
        assert!(rewritten.contains("IF NOT EXISTS \"idx_orders_status\""));
    }

    #[test]
    fn canonical_index_def_ignores_if_not_exists() {
        let a = "CREATE INDEX idx ON public.orders (status)";
        let b = "CREATE INDEX IF NOT EXISTS idx ON stage.orders (status)";
        assert_eq!(
            canonical_index_def(a, "public", "stage"),
            canonical_index_def(b, "stage", "stage")
        );
    }

    #[test]
    fn rewrites_trigger_on_and_execute_clauses() {
        let def = "CREATE TRIGGER trg_audit AFTER INSERT ON public.orders FOR EACH ROW EXECUTE FUNCTION public.audit_fn()";
        let rewritten = rewrite_trigger_def_for_dest(def, "public", "stage");
        assert!(rewritten.contains("ON \"stage\".\"orders\""));
        assert!(rewritten.contains("EXECUTE FUNCTION \"stage\".\"audit_fn\""));
    }

    #[test]
    fn rewrites_function_create_to_create_or_replace() {
        let def = "CREATE FUNCTION public.touch_updated_at() RETURNS trigger AS $$ ... $$ LANGUAGE plpgsql";
        let rewritten = rewrite_function_def_for_dest(def, "public", "stage");
        assert!(rewritten.starts_with("CREATE OR REPLACE FUNCTION"));
        assert!(rewritten.contains("stage.touch_updated_at"));
    }
}

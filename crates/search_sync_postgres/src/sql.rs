//! SQL text generated from registry declarations.
//!
//! Every table and column name reaching this module has already passed the
//! registry's identifier check; they are still double-quoted here.

use search_sync_core::error::SyncError;
use search_sync_core::ports::Result;
use search_sync_core::schema::{is_identifier, Link, Relation, RelationHop, RootEntity};

pub(crate) fn quote(ident: &str) -> Result<String> {
    if is_identifier(ident) {
        Ok(format!("\"{ident}\""))
    } else {
        Err(SyncError::InvalidInput(format!("invalid identifier '{ident}'")))
    }
}

/// `SELECT <ids>` for one dependency hop; `$1` is the source id array.
pub(crate) fn follow_hop(from_table: &str, hop: &RelationHop) -> Result<String> {
    Ok(match &hop.link {
        Link::ForeignKey { column } => format!(
            "SELECT DISTINCT id::bigint FROM {} WHERE {} = ANY($1)",
            quote(hop.table_name())?,
            quote(column)?
        ),
        Link::Reference { column } => format!(
            "SELECT DISTINCT {col}::bigint FROM {} WHERE id = ANY($1) AND {col} IS NOT NULL",
            quote(from_table)?,
            col = quote(column)?
        ),
        Link::Through {
            table,
            source_column,
            target_column,
        } => format!(
            "SELECT DISTINCT {}::bigint FROM {} WHERE {} = ANY($1)",
            quote(target_column)?,
            quote(table)?,
            quote(source_column)?
        ),
    })
}

struct DocumentSql {
    next_alias: usize,
}

impl DocumentSql {
    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    /// jsonb expression for the row `alias` plus its loaded relations.
    fn row(&mut self, alias: &str, relations: &[Relation]) -> Result<String> {
        let base = format!(
            "(to_jsonb({alias}) - 'search_content' - 'search_vector' - 'search_generation')"
        );
        if relations.is_empty() {
            return Ok(base);
        }
        let mut pairs = Vec::with_capacity(relations.len());
        for relation in relations {
            pairs.push(format!(
                "'{}', {}",
                relation.name.replace('\'', "''"),
                self.relation(alias, relation)?
            ));
        }
        Ok(format!("{base} || jsonb_build_object({})", pairs.join(", ")))
    }

    fn relation(&mut self, parent: &str, relation: &Relation) -> Result<String> {
        let alias = self.alias();
        let table = quote(&relation.table)?;
        let row = self.row(&alias, &relation.relations)?;
        Ok(match &relation.link {
            Link::Reference { column } => format!(
                "(SELECT {row} FROM {table} {alias} WHERE {alias}.id = {parent}.{})",
                quote(column)?
            ),
            Link::ForeignKey { column } => format!(
                "COALESCE((SELECT jsonb_agg({row} ORDER BY {alias}.id) FROM {table} {alias} \
                 WHERE {alias}.{} = {parent}.id), '[]'::jsonb)",
                quote(column)?
            ),
            Link::Through {
                table: through,
                source_column,
                target_column,
            } => {
                let link = self.alias();
                format!(
                    "COALESCE((SELECT jsonb_agg({row} ORDER BY {alias}.id) FROM {table} {alias} \
                     JOIN {} {link} ON {link}.{} = {alias}.id \
                     WHERE {link}.{} = {parent}.id), '[]'::jsonb)",
                    quote(through)?,
                    quote(target_column)?,
                    quote(source_column)?
                )
            }
        })
    }
}

/// `SELECT id, document` for root rows; `$1` is the id array.
pub(crate) fn load_documents(root: &RootEntity) -> Result<String> {
    let mut sql = DocumentSql { next_alias: 1 };
    let document = sql.row("t0", &root.relations)?;
    Ok(format!(
        "SELECT t0.id::bigint, {document} FROM {} t0 WHERE t0.id = ANY($1) ORDER BY t0.id",
        quote(root.table_name())?
    ))
}

/// Columns and indexes a root table needs for ranking.
pub(crate) fn search_columns(root: &RootEntity) -> Result<Vec<String>> {
    let table = quote(root.table_name())?;
    let name = root.table_name();
    Ok(vec![
        format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS search_content TEXT"),
        format!(
            "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS search_generation BIGINT NOT NULL DEFAULT 0"
        ),
        format!(
            "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS search_vector tsvector \
             GENERATED ALWAYS AS (to_tsvector('simple', coalesce(search_content, ''))) STORED"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{name}_search_content_trgm_idx\" \
             ON {table} USING gin (search_content gin_trgm_ops)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{name}_search_vector_idx\" \
             ON {table} USING gin (search_vector)"
        ),
    ])
}

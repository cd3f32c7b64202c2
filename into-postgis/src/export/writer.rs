//! Écriture des enregistrements validés (INSERT multi-lignes ou COPY)

use std::pin::Pin;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use futures::SinkExt;
use geo::Geometry;
use geofeature::{SqlValue, TableSchema, TypedRecord};
use geozero::wkt::WktWriter;
use geozero::GeozeroGeometry;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, CopyInSink};
use tracing::debug;
use wkb::geom_to_wkb;

use super::{quote_ident, TableRef};

/// Limite du protocole PostgreSQL sur le nombre de paramètres d'une requête
const MAX_BIND_PARAMS: usize = 65_535;

/// Intervalle par défaut entre deux événements de progression
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100;

/// Mode de transport des lignes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transport {
    /// INSERT multi-lignes par lots de `batch_size`
    #[default]
    Rows,
    /// Un seul COPY pour tout le flux
    Copy,
}

/// Compteur de progression par deltas
///
/// La somme des deltas émis égale le total compté. Le writer ne compte que
/// les lignes confirmées par la base, donc au rythme des lots : avec un lot
/// de 200 et un intervalle de 100, chaque lot livré produit un delta de 200.
/// Pour un événement toutes les `interval` lignes, prendre
/// `batch_size <= interval`.
#[derive(Debug, Clone)]
pub struct ProgressCounter {
    interval: u64,
    pending: u64,
    total: u64,
}

impl ProgressCounter {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            pending: 0,
            total: 0,
        }
    }

    /// Compte `n` lignes ; retourne un delta dès que l'intervalle est atteint
    pub fn record(&mut self, n: u64) -> Option<u64> {
        self.total += n;
        self.pending += n;
        if self.pending >= self.interval {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    /// Delta restant en fin de flux
    pub fn flush(&mut self) -> Option<u64> {
        (self.pending > 0).then(|| std::mem::take(&mut self.pending))
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Bilan d'un writer terminé
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// Lignes écrites
    pub written: u64,
    /// Dernier delta de progression à émettre
    pub progress: Option<u64>,
}

/// Écrit des `TypedRecord` dans une table ayant la structure du schéma
pub struct BatchWriter<'a> {
    client: &'a Client,
    table: TableRef,
    schema: TableSchema,
    batch_size: usize,
    transport: Transport,
    buffer: Vec<TypedRecord>,
    progress: ProgressCounter,
    copy: Option<Pin<Box<CopyInSink<Bytes>>>>,
    wkt_buf: Vec<u8>,
}

impl<'a> BatchWriter<'a> {
    pub fn new(
        client: &'a Client,
        table: TableRef,
        schema: TableSchema,
        batch_size: usize,
        transport: Transport,
        progress_interval: u64,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            client,
            table,
            schema,
            batch_size,
            transport,
            buffer: Vec::with_capacity(batch_size),
            progress: ProgressCounter::new(progress_interval),
            copy: None,
            wkt_buf: Vec::new(),
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Ajoute un enregistrement ; retourne un delta de progression éventuel
    pub async fn write(&mut self, record: TypedRecord) -> Result<Option<u64>> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            return self.flush().await;
        }
        Ok(None)
    }

    async fn flush(&mut self) -> Result<Option<u64>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let records = std::mem::take(&mut self.buffer);

        match self.transport {
            Transport::Rows => {
                let inserted =
                    insert_rows(self.client, &self.table, &self.schema, &records).await?;
                Ok(self.progress.record(inserted))
            }
            Transport::Copy => {
                self.copy_rows(&records).await?;
                Ok(None)
            }
        }
    }

    /// Vide le tampon, termine le COPY éventuel et retourne le bilan
    pub async fn finish(mut self) -> Result<WriteSummary> {
        let mut progress = self.flush().await?;

        let written = match self.copy.take() {
            Some(mut sink) => {
                let rows = sink
                    .as_mut()
                    .finish()
                    .await
                    .with_context(|| format!("Failed to finish COPY into {}", self.table))?;
                progress = (rows > 0).then_some(rows);
                rows
            }
            None if self.transport == Transport::Copy => 0,
            None => {
                if let Some(delta) = self.progress.flush() {
                    progress = Some(progress.unwrap_or(0) + delta);
                }
                self.progress.total()
            }
        };

        debug!(table = %self.table, written, "Writer finished");
        Ok(WriteSummary { written, progress })
    }

    async fn copy_rows(&mut self, records: &[TypedRecord]) -> Result<()> {
        if self.copy.is_none() {
            let sql = copy_statement(&self.table, &self.schema);
            let sink = self
                .client
                .copy_in::<_, Bytes>(sql.as_str())
                .await
                .with_context(|| format!("Failed to start COPY into {}", self.table))?;
            self.copy = Some(Box::pin(sink));
        }

        let buf = encode_copy_chunk(
            records,
            self.schema.len(),
            self.schema.geometry_srid(),
            &mut self.wkt_buf,
        )
        .with_context(|| format!("Failed to encode COPY rows for {}", self.table))?;

        if let Some(sink) = self.copy.as_mut() {
            sink.as_mut()
                .send(buf)
                .await
                .context("Failed to send COPY chunk")?;
        }
        Ok(())
    }
}

/// Envoie les INSERT d'un lot en pipeline sur la connexion
async fn insert_rows(
    client: &Client,
    table: &TableRef,
    schema: &TableSchema,
    records: &[TypedRecord],
) -> Result<u64> {
    let srid = schema.geometry_srid().unwrap_or(0);
    let statements = build_insert_statements(table, schema, records, srid)?;

    let counts = try_join_all(statements.iter().map(|statement| {
        let params: Vec<&(dyn ToSql + Sync)> = statement
            .params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        async move { client.execute(statement.sql.as_str(), &params).await }
    }))
    .await
    .with_context(|| format!("Failed to insert batch into {}", table))?;

    Ok(counts.into_iter().sum())
}

/// Requête INSERT et ses paramètres
pub struct InsertStatement {
    pub sql: String,
    pub params: Vec<Box<dyn ToSql + Sync + Send>>,
}

/// Construit les INSERT d'un lot
///
/// Les enregistrements sont groupés par jeu de colonnes renseignées : une
/// valeur absente n'est jamais écrite comme NULL et la valeur par défaut
/// de la colonne s'applique.
pub fn build_insert_statements(
    table: &TableRef,
    schema: &TableSchema,
    records: &[TypedRecord],
    srid: i32,
) -> Result<Vec<InsertStatement>> {
    let mut groups: Vec<((Vec<usize>, bool), Vec<&TypedRecord>)> = Vec::new();
    for record in records {
        let key = (record.positions(), record.geometry.is_some());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(record),
            None => groups.push((key, vec![record])),
        }
    }

    let mut statements = Vec::new();
    for ((positions, with_geometry), members) in groups {
        let mut columns: Vec<String> = positions
            .iter()
            .filter_map(|p| schema.column(*p))
            .map(|c| quote_ident(&c.name))
            .collect();
        if with_geometry {
            columns.push("geometry".to_string());
        }
        let per_row = columns.len();
        if per_row == 0 {
            continue;
        }
        let rows_per_statement = (MAX_BIND_PARAMS / per_row).max(1);

        for chunk in members.chunks(rows_per_statement) {
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(chunk.len() * per_row);
            let mut tuples = Vec::with_capacity(chunk.len());

            for record in chunk {
                let mut placeholders = Vec::with_capacity(per_row);
                for (_, value) in &record.values {
                    params.push(sql_param(value));
                    placeholders.push(format!("${}", params.len()));
                }
                if let Some(geometry) = &record.geometry {
                    params.push(Box::new(geometry_to_wkb(geometry)?));
                    placeholders.push(format!("ST_GeomFromWKB(${}, {})", params.len(), srid));
                }
                tuples.push(format!("({})", placeholders.join(", ")));
            }

            statements.push(InsertStatement {
                sql: format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    table.qualified(),
                    columns.join(", "),
                    tuples.join(", ")
                ),
                params,
            });
        }
    }

    Ok(statements)
}

fn sql_param(value: &SqlValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        SqlValue::Text(v) => Box::new(v.clone()),
        SqlValue::Double(v) => Box::new(*v),
        SqlValue::Integer(v) => Box::new(*v),
        SqlValue::BigInt(v) => Box::new(*v),
        SqlValue::TimestampTz(v) => Box::new(*v),
        SqlValue::Timestamp(v) => Box::new(*v),
        SqlValue::Boolean(v) => Box::new(*v),
    }
}

/// Convertit une géométrie geo en WKB
fn geometry_to_wkb(geom: &Geometry) -> Result<Vec<u8>> {
    geom_to_wkb(geom).map_err(|e| anyhow::anyhow!("Failed to convert geometry to WKB: {:?}", e))
}

/// Commande COPY couvrant toutes les colonnes du schéma (+ géométrie)
pub fn copy_statement(table: &TableRef, schema: &TableSchema) -> String {
    let mut columns: Vec<String> = schema.names().map(quote_ident).collect();
    if schema.has_geometry() {
        columns.push("geometry".to_string());
    }
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, DELIMITER '|', QUOTE '\"', ESCAPE '\"', NULL '')",
        table.qualified(),
        columns.join(", ")
    )
}

/// Encode un lot de lignes CSV ; une ligne invalide fait échouer le lot
fn encode_copy_chunk(
    records: &[TypedRecord],
    column_count: usize,
    geometry_srid: Option<i32>,
    wkt_buf: &mut Vec<u8>,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(records.len() * 128);
    for (index, record) in records.iter().enumerate() {
        write_copy_row(&mut buf, record, column_count, geometry_srid, wkt_buf)
            .with_context(|| format!("Row {} of the batch", index + 1))?;
    }
    Ok(buf.freeze())
}

fn push_csv_text_field(buf: &mut BytesMut, value: &str) {
    buf.extend_from_slice(b"\"");
    for b in value.as_bytes() {
        match *b {
            b'"' => buf.extend_from_slice(b"\"\""),
            _ => buf.extend_from_slice(&[*b]),
        }
    }
    buf.extend_from_slice(b"\"");
}

/// Écrit une ligne CSV ; en cas d'erreur le tampon est laissé intact
///
/// `geometry_srid` vaut `None` quand la table n'a pas de colonne géométrie.
fn write_copy_row(
    buf: &mut BytesMut,
    record: &TypedRecord,
    column_count: usize,
    geometry_srid: Option<i32>,
    wkt_buf: &mut Vec<u8>,
) -> Result<()> {
    let start_len = buf.len();

    let res: Result<()> = (|| {
        if record.values.is_empty() && record.geometry.is_none() {
            anyhow::bail!("Row has neither values nor geometry");
        }

        let mut values = record.values.iter().peekable();
        for position in 0..column_count {
            if position > 0 {
                buf.extend_from_slice(b"|");
            }
            // Colonne absente : champ vide = NULL
            if let Some((_, value)) = values.next_if(|(p, _)| *p == position) {
                match value {
                    SqlValue::Text(v) => push_csv_text_field(buf, v),
                    SqlValue::Double(v) => buf.extend_from_slice(format_double(*v).as_bytes()),
                    SqlValue::Integer(v) => buf.extend_from_slice(v.to_string().as_bytes()),
                    SqlValue::BigInt(v) => buf.extend_from_slice(v.to_string().as_bytes()),
                    SqlValue::TimestampTz(v) => buf.extend_from_slice(v.to_rfc3339().as_bytes()),
                    SqlValue::Timestamp(v) => {
                        buf.extend_from_slice(v.format("%Y-%m-%d %H:%M:%S%.f").to_string().as_bytes())
                    }
                    SqlValue::Boolean(v) => {
                        buf.extend_from_slice(if *v { b"t" } else { b"f" })
                    }
                }
            }
        }

        if let Some(srid) = geometry_srid {
            if column_count > 0 {
                buf.extend_from_slice(b"|");
            }
            if let Some(geometry) = &record.geometry {
                wkt_buf.clear();
                {
                    let mut writer = WktWriter::new(&mut *wkt_buf);
                    geometry
                        .process_geom(&mut writer)
                        .context("Failed to encode geometry to WKT")?;
                }
                buf.extend_from_slice(b"\"SRID=");
                buf.extend_from_slice(srid.to_string().as_bytes());
                buf.extend_from_slice(b";");
                buf.extend_from_slice(&wkt_buf[..]);
                buf.extend_from_slice(b"\"");
            }
        }

        buf.extend_from_slice(b"\n");
        Ok(())
    })();

    if res.is_err() {
        buf.truncate(start_len);
    }

    res
}

fn format_double(v: f64) -> String {
    if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Point;

    fn schema() -> TableSchema {
        TableSchema::from_pairs([("nom", "text"), ("pop", "integer")], Some(4326))
    }

    fn record(values: Vec<(usize, SqlValue)>, geometry: Option<Geometry>) -> TypedRecord {
        TypedRecord { values, geometry }
    }

    #[test]
    fn test_progress_counter_deltas_sum_to_total() {
        let mut counter = ProgressCounter::new(100);
        let mut emitted = Vec::new();
        for _ in 0..7 {
            if let Some(delta) = counter.record(40) {
                emitted.push(delta);
            }
        }
        if let Some(delta) = counter.flush() {
            emitted.push(delta);
        }

        assert_eq!(emitted, vec![120, 120, 40]);
        assert_eq!(emitted.iter().sum::<u64>(), 280);
        assert_eq!(counter.total(), 280);
        assert_eq!(counter.flush(), None);
    }

    #[test]
    fn test_insert_groups_by_column_set() {
        let table = TableRef::new("public", "t");
        let records = vec![
            record(vec![(0, SqlValue::Text("a".into())), (1, SqlValue::Integer(1))], None),
            record(vec![(0, SqlValue::Text("b".into()))], None),
            record(vec![(0, SqlValue::Text("c".into())), (1, SqlValue::Integer(3))], None),
        ];

        let statements = build_insert_statements(&table, &schema(), &records, 4326).unwrap();

        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO \"public\".\"t\" (\"nom\", \"pop\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(statements[0].params.len(), 4);
        assert_eq!(
            statements[1].sql,
            "INSERT INTO \"public\".\"t\" (\"nom\") VALUES ($1)"
        );
    }

    #[test]
    fn test_insert_geometry_placeholder() {
        let table = TableRef::new("public", "t");
        let records = vec![record(
            vec![(1, SqlValue::Integer(7))],
            Some(Geometry::Point(Point::new(1.0, 2.0))),
        )];

        let statements = build_insert_statements(&table, &schema(), &records, 2154).unwrap();

        assert_eq!(
            statements[0].sql,
            "INSERT INTO \"public\".\"t\" (\"pop\", geometry) VALUES ($1, ST_GeomFromWKB($2, 2154))"
        );
    }

    #[test]
    fn test_insert_respects_parameter_limit() {
        let table = TableRef::new("public", "t");
        let records: Vec<TypedRecord> = (0..40_000)
            .map(|i| {
                record(
                    vec![(0, SqlValue::Text(format!("n{i}"))), (1, SqlValue::Integer(i))],
                    None,
                )
            })
            .collect();

        let statements = build_insert_statements(&table, &schema(), &records, 4326).unwrap();

        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|s| s.params.len() <= MAX_BIND_PARAMS));
        let total: usize = statements.iter().map(|s| s.params.len()).sum();
        assert_eq!(total, 80_000);
    }

    #[test]
    fn test_copy_statement() {
        let sql = copy_statement(&TableRef::new("public", "t"), &schema());
        assert_eq!(
            sql,
            "COPY \"public\".\"t\" (\"nom\", \"pop\", geometry) FROM STDIN WITH (FORMAT csv, DELIMITER '|', QUOTE '\"', ESCAPE '\"', NULL '')"
        );
    }

    #[test]
    fn test_copy_row_layout() {
        let mut buf = BytesMut::new();
        let mut wkt = Vec::new();
        let row = record(
            vec![(0, SqlValue::Text("say \"hi\"|x".into()))],
            Some(Geometry::Point(Point::new(1.0, 2.0))),
        );

        write_copy_row(&mut buf, &row, 2, Some(4326), &mut wkt).unwrap();

        let line = std::str::from_utf8(&buf).unwrap();
        assert!(line.starts_with("\"say \"\"hi\"\"|x\"||\"SRID=4326;POINT"));
        assert!(line.ends_with("\"\n"));
    }

    #[test]
    fn test_copy_row_without_geometry() {
        let mut buf = BytesMut::new();
        let mut wkt = Vec::new();
        let row = record(vec![(1, SqlValue::Integer(5))], None);

        write_copy_row(&mut buf, &row, 2, Some(4326), &mut wkt).unwrap();
        assert_eq!(std::str::from_utf8(&buf).unwrap(), "|5|\n");

        buf.clear();
        write_copy_row(&mut buf, &row, 2, None, &mut wkt).unwrap();
        assert_eq!(std::str::from_utf8(&buf).unwrap(), "|5\n");
    }

    #[test]
    fn test_copy_row_rejects_empty_record() {
        let mut buf = BytesMut::from("kept\n");
        let mut wkt = Vec::new();
        let row = record(vec![], None);

        assert!(write_copy_row(&mut buf, &row, 2, Some(4326), &mut wkt).is_err());
        assert_eq!(&buf[..], b"kept\n");
    }

    #[test]
    fn test_progress_follows_batch_flushes() {
        let mut counter = ProgressCounter::new(100);
        assert_eq!(counter.record(200), Some(200));
        assert_eq!(counter.record(60), None);
        assert_eq!(counter.flush(), Some(60));
        assert_eq!(counter.total(), 260);
    }

    #[test]
    fn test_copy_chunk_fails_on_bad_row() {
        let mut wkt = Vec::new();
        let rows = vec![
            record(vec![(0, SqlValue::Text("a".into()))], None),
            record(vec![], None),
            record(vec![(1, SqlValue::Integer(2))], None),
        ];

        let err = encode_copy_chunk(&rows, 2, None, &mut wkt).unwrap_err();
        assert!(format!("{err:#}").contains("Row 2 of the batch"));

        let chunk = encode_copy_chunk(&rows[..1], 2, None, &mut wkt).unwrap();
        assert_eq!(&chunk[..], b"\"a\"|\n");
    }
}

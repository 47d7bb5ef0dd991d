//! Unbuffered writes awaited by the caller.
//!
//! [`DirectWriteApi`] sends every call as one request and returns the
//! transport outcome. There is no batching, no retry and no event
//! notification; callers that want those use [`crate::WriteApi`].

use std::sync::Arc;

use crate::entity::{Entity, ErasedEntity};
use crate::error::Result;
use crate::line_protocol::{PendingItem, render_items};
use crate::options::WriteDefaults;
use crate::point::{Point, group_by_precision};
use crate::target::{WritePrecision, WriteTarget};
use crate::transport::{ContentEncoding, WriteRequest, WriteTransport};

/// Writes that complete before the call returns.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fluxline::{DirectWriteApi, HttpConfig, HttpTransport, WriteDefaults, WritePrecision};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = HttpTransport::new(HttpConfig::new("http://localhost:8086"))?;
/// let api = DirectWriteApi::new(
///     Arc::new(transport),
///     WriteDefaults::default().with_bucket("b").with_organization("o"),
/// );
///
/// api.write_records(WritePrecision::S, ["cpu,host=a usage=0.5 1700000000"]).await?;
/// # Ok(())
/// # }
/// ```
pub struct DirectWriteApi {
    transport: Arc<dyn WriteTransport>,
    defaults: WriteDefaults,
    content_encoding: ContentEncoding,
}

impl DirectWriteApi {
    /// Creates a direct writer.
    pub fn new(transport: Arc<dyn WriteTransport>, defaults: WriteDefaults) -> Self {
        Self {
            transport,
            defaults,
            content_encoding: ContentEncoding::default(),
        }
    }

    /// Sets the request body encoding.
    #[must_use]
    pub fn with_content_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    /// Writes line-protocol records to the default destination.
    ///
    /// # Errors
    ///
    /// Returns a config error if no destination resolves, or the transport
    /// error of the write call.
    pub async fn write_records<I>(&self, precision: WritePrecision, records: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.write_records_to_opt(None, None, precision, records).await
    }

    /// Writes line-protocol records to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`DirectWriteApi::write_records`].
    pub async fn write_records_to<I>(
        &self,
        bucket: &str,
        organization: &str,
        precision: WritePrecision,
        records: I,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.write_records_to_opt(Some(bucket), Some(organization), precision, records)
            .await
    }

    /// Writes points to the default destination, one request per precision.
    ///
    /// # Errors
    ///
    /// See [`DirectWriteApi::write_records`].
    pub async fn write_points<'a, I>(&self, points: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        self.write_points_to_opt(None, None, points).await
    }

    /// Writes points to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`DirectWriteApi::write_records`].
    pub async fn write_points_to<'a, I>(
        &self,
        bucket: &str,
        organization: &str,
        points: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        self.write_points_to_opt(Some(bucket), Some(organization), points)
            .await
    }

    /// Maps entities and writes them to the default destination.
    ///
    /// # Errors
    ///
    /// Returns a mapping error before anything is sent, besides the errors
    /// of [`DirectWriteApi::write_records`].
    pub async fn write_measurements<'a, E, I>(
        &self,
        precision: WritePrecision,
        entities: I,
    ) -> Result<()>
    where
        E: Entity,
        I: IntoIterator<Item = &'a E>,
    {
        self.write_measurements_to_opt(None, None, precision, entities)
            .await
    }

    /// Maps entities and writes them to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`DirectWriteApi::write_measurements`].
    pub async fn write_measurements_to<'a, E, I>(
        &self,
        bucket: &str,
        organization: &str,
        precision: WritePrecision,
        entities: I,
    ) -> Result<()>
    where
        E: Entity,
        I: IntoIterator<Item = &'a E>,
    {
        self.write_measurements_to_opt(Some(bucket), Some(organization), precision, entities)
            .await
    }

    async fn write_records_to_opt<I>(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        precision: WritePrecision,
        records: I,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let target = self.defaults.resolve(bucket, organization, precision)?;
        let records: Vec<I::Item> = records.into_iter().collect();
        let fragments = render_items(
            records.iter().map(|r| PendingItem::Record(r.as_ref())),
            precision,
            &self.defaults.default_tags,
        )?;
        self.send(&target, &fragments).await
    }

    async fn write_points_to_opt<'a, I>(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        points: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        let mut prepared = Vec::new();
        for (precision, group) in group_by_precision(points) {
            let target = self.defaults.resolve(bucket, organization, precision)?;
            let fragments: Vec<String> = group
                .into_iter()
                .filter_map(|p| p.to_line_protocol(&self.defaults.default_tags))
                .collect();
            prepared.push((target, fragments));
        }

        for (target, fragments) in &prepared {
            self.send(target, fragments).await?;
        }
        Ok(())
    }

    async fn write_measurements_to_opt<'a, E, I>(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        precision: WritePrecision,
        entities: I,
    ) -> Result<()>
    where
        E: Entity,
        I: IntoIterator<Item = &'a E>,
    {
        let target = self.defaults.resolve(bucket, organization, precision)?;
        let fragments = render_items(
            entities
                .into_iter()
                .map(|e| PendingItem::Entity(e as &dyn ErasedEntity)),
            precision,
            &self.defaults.default_tags,
        )?;
        self.send(&target, &fragments).await
    }

    async fn send(&self, target: &WriteTarget, fragments: &[String]) -> Result<()> {
        if fragments.is_empty() {
            tracing::trace!(%target, "nothing writable, skipping request");
            return Ok(());
        }

        let request = WriteRequest::encode(target, &fragments.join("\n"), self.content_encoding)?;
        self.transport.post_write(&request).await?;
        tracing::debug!(%target, lines = fragments.len(), "direct write completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Column, EntitySchema, Value};
    use crate::error::{FluxlineError, MappingError, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<(WritePrecision, String)>>,
        fail_with: Option<TransportError>,
    }

    #[async_trait]
    impl WriteTransport for Recorder {
        async fn post_write(&self, request: &WriteRequest) -> std::result::Result<(), TransportError> {
            let body = String::from_utf8_lossy(&request.body).into_owned();
            self.requests.lock().unwrap().push((request.precision, body));
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    struct Reading {
        sensor: &'static str,
        value: Option<f64>,
    }

    impl Entity for Reading {
        fn schema() -> EntitySchema {
            EntitySchema::new("reading")
                .column(Column::tag("sensor"))
                .column(Column::field("value"))
        }

        fn value(&self, property: &str) -> Value<'_> {
            match property {
                "sensor" => self.sensor.into(),
                "value" => self.value.into(),
                _ => Value::Null,
            }
        }
    }

    struct NoName;

    impl Entity for NoName {
        fn schema() -> EntitySchema {
            EntitySchema::new("").column(Column::field("v"))
        }

        fn value(&self, _property: &str) -> Value<'_> {
            Value::Int(1)
        }
    }

    fn api(recorder: Arc<Recorder>) -> DirectWriteApi {
        DirectWriteApi::new(
            recorder,
            WriteDefaults::default()
                .with_bucket("b")
                .with_organization("o"),
        )
    }

    #[tokio::test]
    async fn test_records_sent_in_one_request() {
        let recorder = Arc::new(Recorder::default());
        api(recorder.clone())
            .write_records(WritePrecision::S, ["m v=1 1", "", "m v=2 2"])
            .await
            .unwrap();

        assert_eq!(
            *recorder.requests.lock().unwrap(),
            vec![(WritePrecision::S, "m v=1 1\nm v=2 2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_input_sends_nothing() {
        let recorder = Arc::new(Recorder::default());
        let api = api(recorder.clone());

        api.write_records(WritePrecision::Ns, Vec::<String>::new())
            .await
            .unwrap();
        api.write_measurements(
            WritePrecision::Ns,
            &[Reading {
                sensor: "a",
                value: None,
            }],
        )
        .await
        .unwrap();

        assert!(recorder.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_points_one_request_per_precision() {
        let recorder = Arc::new(Recorder::default());
        let points = [
            Point::measurement("a").field("v", 1).timestamp(1, WritePrecision::S),
            Point::measurement("b").field("v", 2).timestamp(2, WritePrecision::Ms),
        ];

        api(recorder.clone()).write_points(&points).await.unwrap();

        let requests = recorder.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], (WritePrecision::S, "a v=1i 1".to_string()));
        assert_eq!(requests[1], (WritePrecision::Ms, "b v=2i 2".to_string()));
    }

    #[tokio::test]
    async fn test_transport_error_is_returned() {
        let recorder = Arc::new(Recorder {
            fail_with: Some(TransportError::Http {
                status: 401,
                message: "unauthorized access".to_string(),
                retry_after: None,
            }),
            ..Recorder::default()
        });

        let err = api(recorder)
            .write_measurements(
                WritePrecision::Ns,
                &[Reading {
                    sensor: "a",
                    value: Some(1.5),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FluxlineError::Transport(TransportError::Http { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_mapping_error_sends_nothing() {
        let recorder = Arc::new(Recorder::default());
        let err = api(recorder.clone())
            .write_measurements(WritePrecision::Ns, &[NoName])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FluxlineError::Mapping(MappingError::EmptyMeasurement { .. })
        ));
        assert!(recorder.requests.lock().unwrap().is_empty());
    }
}

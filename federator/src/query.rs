//! Validated query parameters, selector parsing, and cache fingerprints.

use http::StatusCode;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::errors::FederatorError;
use crate::model::{Stream, StreamEpoch, format_timestamp, parse_timestamp};

/// Output format of the merged response
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    MiniSeed,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self, FederatorError> {
        match value {
            "miniseed" | "mseed" => Ok(OutputFormat::MiniSeed),
            other => Err(FederatorError::InvalidQuery(format!(
                "unsupported format: {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::MiniSeed => "miniseed",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::MiniSeed => "application/vnd.fdsn.mseed",
        }
    }
}

/// Client-selected status for empty results; FDSN allows 204 or 404.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoData(u16);

impl NoData {
    pub fn parse(value: &str) -> Result<Self, FederatorError> {
        match value {
            "204" => Ok(NoData(204)),
            "404" => Ok(NoData(404)),
            other => Err(FederatorError::InvalidQuery(format!(
                "nodata must be 204 or 404, got {other:?}"
            ))),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0).expect("nodata status")
    }
}

impl Default for NoData {
    fn default() -> Self {
        NoData(204)
    }
}

/// Validated output options of a query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub format: OutputFormat,
    pub nodata: NoData,
}

/// A validated federation query: output options plus a non-empty set of
/// stream epoch selectors.
#[derive(Clone, Debug)]
pub struct Query {
    pub params: QueryParams,
    pub stream_epochs: Vec<StreamEpoch>,
}

impl Query {
    /// Parse the query string of a GET request.
    ///
    /// Selector codes default to `*`; `starttime` is required, `endtime`
    /// may be omitted for an open interval. Comma lists in the code
    /// parameters pass through verbatim (the routing service expands
    /// them).
    pub fn from_get(query: &str) -> Result<Self, FederatorError> {
        let mut network = String::from("*");
        let mut station = String::from("*");
        let mut location = String::from("*");
        let mut channel = String::from("*");
        let mut start = None;
        let mut end = None;
        let mut params = QueryParams::default();

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            match key.as_ref() {
                "network" | "net" => network = value.to_string(),
                "station" | "sta" => station = value.to_string(),
                "location" | "loc" => location = value.to_string(),
                "channel" | "cha" => channel = value.to_string(),
                "starttime" | "start" => start = Some(parse_timestamp(value)?),
                "endtime" | "end" => end = Some(parse_timestamp(value)?),
                "format" => params.format = OutputFormat::parse(value)?,
                "nodata" => params.nodata = NoData::parse(value)?,
                other => {
                    return Err(FederatorError::InvalidQuery(format!(
                        "unknown parameter: {other:?}"
                    )));
                }
            }
        }

        let Some(start) = start else {
            return Err(FederatorError::InvalidQuery(
                "missing required parameter: starttime".to_string(),
            ));
        };

        let stream = Stream::new(&network, &station, &location, &channel);
        let epoch = StreamEpoch::new(stream, start, end)?;

        Ok(Query {
            params,
            stream_epochs: vec![epoch],
        })
    }

    /// Parse a POST body: `key=value` parameter lines followed by one
    /// `NET STA LOC CHA START END` selector line per stream epoch.
    pub fn from_post(body: &str) -> Result<Self, FederatorError> {
        let mut params = QueryParams::default();
        let mut stream_epochs = Vec::new();

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "format" => params.format = OutputFormat::parse(value.trim())?,
                    "nodata" => params.nodata = NoData::parse(value.trim())?,
                    other => {
                        return Err(FederatorError::InvalidQuery(format!(
                            "unknown parameter: {other:?}"
                        )));
                    }
                }
                continue;
            }

            stream_epochs.push(StreamEpoch::from_selector_line(line)?);
        }

        if stream_epochs.is_empty() {
            return Err(FederatorError::InvalidQuery(
                "at least one stream epoch selector is required".to_string(),
            ));
        }

        Ok(Query {
            params,
            stream_epochs,
        })
    }

    /// Deterministic cache key over the normalized query: output format
    /// plus the sorted selector lines. Two requests for the same data
    /// land on the same entry regardless of selector order or transport
    /// (GET vs. POST).
    pub fn fingerprint(&self) -> String {
        let mut lines: Vec<String> = self
            .stream_epochs
            .iter()
            .map(|epoch| {
                let end = match epoch.end {
                    Some(end) => format_timestamp(end),
                    None => "open".to_string(),
                };
                format!(
                    "{} {} {} {} {} {}",
                    epoch.stream.network,
                    epoch.stream.station,
                    epoch.stream.location_code(),
                    epoch.stream.channel,
                    format_timestamp(epoch.start),
                    end,
                )
            })
            .collect();
        lines.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.params.format.as_str().as_bytes());
        for line in &lines {
            hasher.update(b"\n");
            hasher.update(line.as_bytes());
        }

        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_from_get() {
        let query = Query::from_get(
            "net=GR&station=BFO&cha=BHZ&start=2020-01-01T00:00:00&end=2020-01-02T00:00:00&nodata=404",
        )
        .unwrap();

        assert_eq!(query.stream_epochs.len(), 1);
        let epoch = &query.stream_epochs[0];
        assert_eq!(epoch.stream.network, "GR");
        assert_eq!(epoch.stream.station, "BFO");
        assert_eq!(epoch.stream.location, "*");
        assert_eq!(epoch.stream.channel, "BHZ");
        assert_eq!(epoch.start, datetime!(2020-01-01 00:00:00 UTC));
        assert_eq!(epoch.end, Some(datetime!(2020-01-02 00:00:00 UTC)));
        assert_eq!(query.params.nodata.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_from_get_open_end() {
        let query = Query::from_get("start=2020-01-01T00:00:00").unwrap();
        assert_eq!(query.stream_epochs[0].end, None);
        assert_eq!(query.params.nodata.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn test_from_get_rejects_bad_input() {
        // Missing starttime
        assert!(Query::from_get("net=GR").is_err());
        // Unknown parameter
        assert!(Query::from_get("start=2020-01-01&quality=B").is_err());
        // Unsupported format
        assert!(Query::from_get("start=2020-01-01&format=xml").is_err());
        // Bad nodata
        assert!(Query::from_get("start=2020-01-01&nodata=500").is_err());
    }

    #[test]
    fn test_from_post() {
        let body = "\
format=miniseed
nodata=404

GR BFO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00
CH DAVOX -- HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00
";
        let query = Query::from_post(body).unwrap();

        assert_eq!(query.stream_epochs.len(), 2);
        assert_eq!(query.stream_epochs[1].stream.station, "DAVOX");
        assert_eq!(query.params.nodata.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_from_post_requires_selectors() {
        assert!(Query::from_post("format=miniseed\n").is_err());
        assert!(Query::from_post("").is_err());
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = Query::from_post(
            "GR BFO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n\
             CH DAVOX -- HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n",
        )
        .unwrap();
        let b = Query::from_post(
            "CH DAVOX -- HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n\
             GR BFO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n",
        )
        .unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_depends_on_interval() {
        let a = Query::from_post("GR BFO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n").unwrap();
        let b = Query::from_post("GR BFO -- BHZ 2020-01-01T00:00:00 2020-01-03T00:00:00\n").unwrap();

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_nodata_does_not_affect_fingerprint() {
        let a = Query::from_post("GR BFO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n").unwrap();
        let b = Query::from_post(
            "nodata=404\nGR BFO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n",
        )
        .unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}

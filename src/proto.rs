//! Wire-format message types.
//!
//! Two protobuf schemas cross this proxy's boundaries: the remote-write
//! request (`prometheus.WriteRequest`, proto3) that is both ingested and
//! re-emitted to backends, and the scrape data model
//! (`io.prometheus.client.MetricFamily`, proto2) accepted by the push
//! gateway's delimited-protobuf content type. The types are derived by hand
//! with matching field numbers so the build does not depend on `protoc`.

/// `prometheus.WriteRequest` and friends (proto3).
pub mod remote {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteRequest {
        #[prost(message, repeated, tag = "1")]
        pub timeseries: ::prost::alloc::vec::Vec<TimeSeries>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TimeSeries {
        #[prost(message, repeated, tag = "1")]
        pub labels: ::prost::alloc::vec::Vec<Label>,
        #[prost(message, repeated, tag = "2")]
        pub samples: ::prost::alloc::vec::Vec<Sample>,
    }

    #[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, ::prost::Message)]
    pub struct Label {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub value: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Sample {
        #[prost(double, tag = "1")]
        pub value: f64,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

/// `io.prometheus.client` metric families (proto2).
pub mod client {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum MetricType {
        Counter = 0,
        Gauge = 1,
        Summary = 2,
        Untyped = 3,
        Histogram = 4,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LabelPair {
        #[prost(string, optional, tag = "1")]
        pub name: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(string, optional, tag = "2")]
        pub value: ::core::option::Option<::prost::alloc::string::String>,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Gauge {
        #[prost(double, optional, tag = "1")]
        pub value: ::core::option::Option<f64>,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Counter {
        #[prost(double, optional, tag = "1")]
        pub value: ::core::option::Option<f64>,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Quantile {
        #[prost(double, optional, tag = "1")]
        pub quantile: ::core::option::Option<f64>,
        #[prost(double, optional, tag = "2")]
        pub value: ::core::option::Option<f64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Summary {
        #[prost(uint64, optional, tag = "1")]
        pub sample_count: ::core::option::Option<u64>,
        #[prost(double, optional, tag = "2")]
        pub sample_sum: ::core::option::Option<f64>,
        #[prost(message, repeated, tag = "3")]
        pub quantile: ::prost::alloc::vec::Vec<Quantile>,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Untyped {
        #[prost(double, optional, tag = "1")]
        pub value: ::core::option::Option<f64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Histogram {
        #[prost(uint64, optional, tag = "1")]
        pub sample_count: ::core::option::Option<u64>,
        #[prost(double, optional, tag = "2")]
        pub sample_sum: ::core::option::Option<f64>,
        #[prost(message, repeated, tag = "3")]
        pub bucket: ::prost::alloc::vec::Vec<Bucket>,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Bucket {
        #[prost(uint64, optional, tag = "1")]
        pub cumulative_count: ::core::option::Option<u64>,
        #[prost(double, optional, tag = "2")]
        pub upper_bound: ::core::option::Option<f64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Metric {
        #[prost(message, repeated, tag = "1")]
        pub label: ::prost::alloc::vec::Vec<LabelPair>,
        #[prost(message, optional, tag = "2")]
        pub gauge: ::core::option::Option<Gauge>,
        #[prost(message, optional, tag = "3")]
        pub counter: ::core::option::Option<Counter>,
        #[prost(message, optional, tag = "4")]
        pub summary: ::core::option::Option<Summary>,
        #[prost(message, optional, tag = "5")]
        pub untyped: ::core::option::Option<Untyped>,
        #[prost(message, optional, tag = "7")]
        pub histogram: ::core::option::Option<Histogram>,
        #[prost(int64, optional, tag = "6")]
        pub timestamp_ms: ::core::option::Option<i64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricFamily {
        #[prost(string, optional, tag = "1")]
        pub name: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(string, optional, tag = "2")]
        pub help: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(enumeration = "MetricType", optional, tag = "3")]
        pub r#type: ::core::option::Option<i32>,
        #[prost(message, repeated, tag = "4")]
        pub metric: ::prost::alloc::vec::Vec<Metric>,
    }
}

use gantry_controller_xds::ResourceType;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Describes gRPC streams and the discovery traffic they carry.
#[derive(Clone, Debug)]
pub struct GrpcServerMetricsFamily {
    started: Family<Labels, Counter>,
    handling: Family<Labels, Histogram>,
    handled: Family<CodeLabels, Counter>,
    msg_received: Family<Labels, Counter>,
    msg_sent: Family<Labels, Counter>,

    pushes: Family<TypeLabels, Counter>,
    acks: Family<TypeLabels, Counter>,
    nacks: Family<TypeLabels, Counter>,
    slow_proxies: Counter,
}

/// Observes a single stream. Dropping it records the stream as handled.
#[derive(Debug)]
pub(crate) struct StreamObserver {
    metrics: GrpcServerMetricsFamily,
    labels: Labels,
    start: time::Instant,
    code: Option<tonic::Code>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
    grpc_code: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    resource_type: &'static str,
}

// === impl GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::<Labels, Counter>::default();
        reg.register(
            "started",
            "Total number of RPCs started on the server",
            started.clone(),
        );

        let msg_received = Family::<Labels, Counter>::default();
        reg.register(
            "msg_received",
            "Total number of RPC stream messages received on the server",
            msg_received.clone(),
        );

        let msg_sent = Family::<Labels, Counter>::default();
        reg.register(
            "msg_sent",
            "Total number of gRPC stream messages sent by the server",
            msg_sent.clone(),
        );

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "handled",
            "Total number of RPCs completed on the server, regardless of success or failure",
            handled.clone(),
        );

        let handling = Family::<Labels, Histogram>::new_with_constructor(|| {
            // Proxies hold discovery streams for as long as they run.
            Histogram::new([1.0, 60.0, 3600.0, 86400.0])
        });
        reg.register_with_unit(
            "handling",
            "Histogram of the lifetime (seconds) of gRPC streams handled by the server",
            Unit::Seconds,
            handling.clone(),
        );

        let pushes = Family::<TypeLabels, Counter>::default();
        reg.register(
            "discovery_pushes",
            "Total number of discovery responses pushed to proxies",
            pushes.clone(),
        );

        let acks = Family::<TypeLabels, Counter>::default();
        reg.register(
            "discovery_acks",
            "Total number of discovery responses accepted by proxies",
            acks.clone(),
        );

        let nacks = Family::<TypeLabels, Counter>::default();
        reg.register(
            "discovery_nacks",
            "Total number of discovery responses rejected by proxies",
            nacks.clone(),
        );

        let slow_proxies = Counter::default();
        reg.register(
            "slow_proxies",
            "Total number of streams closed because a proxy did not read a push in time",
            slow_proxies.clone(),
        );

        Self {
            started,
            handling,
            handled,
            msg_received,
            msg_sent,
            pushes,
            acks,
            nacks,
            slow_proxies,
        }
    }

    pub(crate) fn bidi_stream_rpc(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
    ) -> StreamObserver {
        let labels = Labels {
            grpc_service,
            grpc_method,
            grpc_type: "bidi_stream",
        };
        self.started.get_or_create(&labels).inc();
        StreamObserver {
            metrics: self.clone(),
            labels,
            start: time::Instant::now(),
            code: None,
        }
    }

    pub(crate) fn pushed(&self, ty: ResourceType) {
        self.pushes.get_or_create(&TypeLabels::from(ty)).inc();
    }

    pub(crate) fn answered(&self, ty: ResourceType, accepted: bool) {
        let family = if accepted { &self.acks } else { &self.nacks };
        family.get_or_create(&TypeLabels::from(ty)).inc();
    }

    pub(crate) fn slow_proxy(&self) {
        self.slow_proxies.inc();
    }
}

// === impl StreamObserver ===

impl StreamObserver {
    pub(crate) fn msg_received(&self) {
        self.metrics
            .msg_received
            .get_or_create(&self.labels)
            .inc();
    }

    pub(crate) fn msg_sent(&self) {
        self.metrics.msg_sent.get_or_create(&self.labels).inc();
    }

    /// Records the status the stream ends with, if not OK.
    pub(crate) fn end(&mut self, code: tonic::Code) {
        self.code = Some(code);
    }

    pub(crate) fn metrics(&self) -> &GrpcServerMetricsFamily {
        &self.metrics
    }
}

impl Drop for StreamObserver {
    fn drop(&mut self) {
        let Labels {
            grpc_service,
            grpc_method,
            grpc_type,
        } = self.labels.clone();
        self.metrics
            .handling
            .get_or_create(&self.labels)
            .observe(self.start.elapsed().as_secs_f64());
        self.metrics
            .handled
            .get_or_create(&CodeLabels {
                grpc_service,
                grpc_method,
                grpc_type,
                grpc_code: code_str(self.code.unwrap_or(tonic::Code::Ok)),
            })
            .inc();
    }
}

impl From<ResourceType> for TypeLabels {
    fn from(ty: ResourceType) -> Self {
        Self {
            resource_type: ty.as_str(),
        }
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}

use crate::store::{Kind, Store};
use gantry_controller_k8s_api::{self as k8s, ResourceExt};
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{
        counter::Counter,
        family::Family,
        gauge::{ConstGauge, Gauge},
        MetricType,
    },
    registry::Registry,
};
use std::sync::Arc;

/// Counts the updates applied to an index.
pub struct IndexMetrics<T> {
    inner: Arc<RwLock<T>>,

    index_size: Family<IndexLabels, Gauge>,
    index_applies: Family<IndexLabels, Counter>,
    index_deletes: Family<IndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

/// Reports the size of a store's dependency index on each scrape.
#[derive(Debug)]
struct DependencyCollector(Arc<RwLock<Store>>);

pub trait SizedIndex<R> {
    fn size(&self) -> usize;
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: Arc<RwLock<T>>, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn record<R>(&self, counter: &Family<IndexLabels, Counter>, update: impl FnOnce(&mut T))
    where
        T: SizedIndex<R>,
        R: ResourceExt<DynamicType = ()>,
    {
        let labels = IndexLabels {
            kind: R::kind(&()).to_string(),
        };
        counter.get_or_create(&labels).inc();
        let size = {
            let mut inner = self.inner.write();
            update(&mut *inner);
            inner.size()
        };
        self.index_size.get_or_create(&labels).set(size as i64);
    }
}

impl<R, T> IndexNamespacedResource<R> for IndexMetrics<T>
where
    T: SizedIndex<R> + IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        self.record::<R>(&self.index_applies, |idx| idx.apply(resource));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.record::<R>(&self.index_deletes, |idx| idx.delete(namespace, name));
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        self.record::<R>(&self.index_resets, |idx| idx.reset(resources, removed));
    }
}

impl<R, T> IndexClusterResource<R> for IndexMetrics<T>
where
    T: SizedIndex<R> + IndexClusterResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        self.record::<R>(&self.index_applies, |idx| idx.apply(resource));
    }

    fn delete(&mut self, name: String) {
        self.record::<R>(&self.index_deletes, |idx| idx.delete(name));
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        self.record::<R>(&self.index_resets, |idx| idx.reset(resources, removed));
    }
}

/// Registers gauges describing the store's dependency tracking.
pub fn register_dependencies(store: Arc<RwLock<Store>>, prom: &mut Registry) {
    prom.register_collector(Box::new(DependencyCollector(store)));
}

// === impl DependencyCollector ===

impl Collector for DependencyCollector {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> std::fmt::Result {
        let (keys, groups) = self.0.read().dependency_count();

        let dependency_keys = ConstGauge::new(keys as i64);
        let metric_encoder = encoder.encode_descriptor(
            "dependency_keys",
            "Number of distinct objects that some group depends on",
            None,
            MetricType::Gauge,
        )?;
        dependency_keys.encode(metric_encoder)?;

        let tracked_groups = ConstGauge::new(groups as i64);
        let metric_encoder = encoder.encode_descriptor(
            "tracked_groups",
            "Number of groups with recorded dependencies",
            None,
            MetricType::Gauge,
        )?;
        tracked_groups.encode(metric_encoder)?;

        Ok(())
    }
}

// === impl SizedIndex ===

macro_rules! sized_by_kind {
    ($($resource:ty => $kind:expr),+ $(,)?) => {
        $(
            impl SizedIndex<$resource> for Store {
                fn size(&self) -> usize {
                    self.len($kind)
                }
            }
        )+
    };
}

sized_by_kind! {
    k8s::GatewayClass => Kind::GatewayClass,
    k8s::Gateway => Kind::Gateway,
    k8s::HttpRoute => Kind::HttpRoute,
    k8s::ReferenceGrant => Kind::ReferenceGrant,
    k8s::Service => Kind::Service,
    k8s::EndpointSlice => Kind::EndpointSlice,
    k8s::Backend => Kind::Backend,
    k8s::Secret => Kind::Secret,
    k8s::TrafficPolicy => Kind::TrafficPolicy,
}

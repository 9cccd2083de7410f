#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Container, ContainerPort, Namespace, Pod, PodSpec, PodStatus},
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
            NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::{
        self,
        pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
    },
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    runtime::watcher,
    Client, Error,
};

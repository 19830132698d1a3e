use kube::CustomResourceExt;
use node_readiness_operator::crd::{NodeReadinessRule, NodeReadinessRuleReport};

fn main() {
    print!(
        "{}---\n{}",
        serde_yaml::to_string(&NodeReadinessRule::crd()).unwrap(),
        serde_yaml::to_string(&NodeReadinessRuleReport::crd()).unwrap()
    );
}

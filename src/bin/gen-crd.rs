use kube::CustomResourceExt;
use stride::crd::rollout::Rollout;

fn main() -> anyhow::Result<()> {
    // Use: cargo run --bin gen-crd > deploy/crd.yaml
    let yaml = serde_yaml::to_string(&Rollout::crd())?;
    print!("{}", yaml);
    Ok(())
}

use echo_service::{EchoServiceServer, FILE_DESCRIPTOR_SET};
use echo_service_impl::EchoServiceImpl;
use latebind_core::binding::ServiceConnector;
use latebind_core::catalog::{ContractCatalog, ContractId, Discovery};
use latebind_core::factory::{ConstructionArgs, ProxyFactory};
use latebind_core::metadata::{MetadataSource, StaticMetadataSource};
use latebind_core::proxy::{Reply, Strategy};
use latebind_core::synthesis::{
    ClientBuilder, ClientModule, CompiledClientBuilder, GenerateOptions, ModuleClientBuilder,
    SynthesisError, codegen, module,
};
use latebind_core::type_cache::ClientTypeCache;
use prost_reflect::DescriptorPool;
use serde_json::json;
use std::sync::Arc;
use tonic::service::Routes;

mod echo_service_impl;

const ADDRESS: &str = "http://echo.test:50051";

async fn catalog() -> ContractCatalog {
    let source = StaticMetadataSource::from_file_descriptor_set(FILE_DESCRIPTOR_SET);
    let fragments = source.fetch(ADDRESS).await.unwrap();
    ContractCatalog::resolve(fragments, &Discovery::new(ADDRESS)).unwrap()
}

#[tokio::test]
async fn test_compiled_client_type_matches_resolved_contract() {
    let catalog = catalog().await;
    let contract = catalog.find_endpoint("echoservice", None).unwrap().contract();

    let source =
        codegen::generate(std::slice::from_ref(contract), &GenerateOptions::default()).unwrap();
    assert!(source.warnings().iter().all(|w| !w.fatal));

    let module = module::compile(&source).unwrap();
    assert!(module.contracts().contains(contract.id()));
    assert!(module.namespaces().contains("echo"));

    let declared = module.contract_type(contract.id()).unwrap();
    assert_eq!(declared.id(), contract.id());

    let client_type = module.proxy_type(contract, Strategy::per_session()).unwrap();
    assert_eq!(client_type.contract().id(), contract.id());
    assert_eq!(client_type.strategy(), Strategy::per_session());
    assert_eq!(
        client_type.registry().entries().len(),
        contract.operations().len()
    );
}

#[tokio::test]
async fn test_materialized_module_loads_again() {
    let catalog = catalog().await;
    let contract = catalog.find_contract("EchoService", Some("ECHO")).unwrap();

    let compiled = CompiledClientBuilder::default()
        .build(contract, Strategy::per_call())
        .unwrap();

    let source =
        codegen::generate(std::slice::from_ref(contract), &GenerateOptions::default()).unwrap();
    let bytes = module::compile(&source).unwrap().encode();
    let builder = ModuleClientBuilder::from_bytes(&bytes).unwrap();
    let loaded = builder.build(contract, Strategy::per_call()).unwrap();

    assert_eq!(loaded.contract().id(), compiled.contract().id());
    assert!(loaded.registry().lookup("Notify").unwrap().description().is_one_way());
}

#[tokio::test]
async fn test_module_without_the_contract() {
    let catalog = catalog().await;
    let contract = catalog.find_contract("EchoService", None).unwrap();
    let module = ClientModule::from_pool(DescriptorPool::new());

    let result = module.proxy_type(contract, Strategy::per_session());
    assert!(matches!(
        result,
        Err(SynthesisError::ProxyTypeNotFound { contract }) if contract == "echo.EchoService"
    ));

    let result = module.contract_type(&ContractId::new("Ghost", "echo"));
    let Err(SynthesisError::UnknownContract { name, namespace }) = result else {
        panic!("Expected an unknown contract error");
    };
    assert_eq!((name.as_str(), namespace.as_str()), ("Ghost", "echo"));
}

#[tokio::test]
async fn test_module_missing_streaming_operations() {
    let catalog = catalog().await;
    let contract = catalog.find_contract("EchoService", None).unwrap();

    let source = codegen::generate(
        std::slice::from_ref(contract),
        &GenerateOptions {
            async_variants: false,
        },
    )
    .unwrap();
    let module = module::compile(&source).unwrap();

    assert!(matches!(
        module.proxy_type(contract, Strategy::per_session()),
        Err(SynthesisError::ProxyTypeNotFound { .. })
    ));
}

#[test]
fn test_invalid_module_bytes() {
    assert!(matches!(
        ModuleClientBuilder::from_bytes(b"not a descriptor set"),
        Err(SynthesisError::Module(_))
    ));
}

#[tokio::test]
async fn test_compiled_proxy_calls() {
    let connector = ServiceConnector::new(Routes::new(EchoServiceServer::new(
        EchoServiceImpl::default(),
    )));
    let factory = ProxyFactory::new(Arc::new(catalog().await), connector)
        .with_builder(CompiledClientBuilder::default())
        .with_type_cache(Arc::new(ClientTypeCache::new()));

    let mut proxy = factory
        .create(Strategy::per_session(), &ConstructionArgs::new("EchoService"))
        .unwrap();

    let reply = proxy
        .call("UnaryEcho", vec![json!({ "message": "compiled" })])
        .await
        .unwrap();
    assert_eq!(reply, Reply::Unary(json!({ "message": "compiled" })));

    let reply = proxy
        .call("ServerStreamingEcho", vec![json!({ "message": "c" })])
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Streaming(items) if items.len() == 3));
}

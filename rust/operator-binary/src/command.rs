//! Command lines executed inside the Kyuubi container.

use crate::charm::SCHEMATOOL_PATH;

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// Imports a CA certificate into the truststore under `alias`.
pub fn import_truststore_ca(
    alias: &str,
    ca: &str,
    truststore: &str,
    password: &str,
) -> Vec<String> {
    args([
        "keytool",
        "-import",
        "-v",
        "-alias",
        alias,
        "-file",
        ca,
        "-keystore",
        truststore,
        "-storepass",
        password,
        "-noprompt",
    ])
}

pub fn rename_truststore_alias(
    from: &str,
    to: &str,
    truststore: &str,
    password: &str,
) -> Vec<String> {
    args([
        "keytool",
        "-changealias",
        "-alias",
        from,
        "-destalias",
        to,
        "-keystore",
        truststore,
        "-storepass",
        password,
    ])
}

pub fn delete_truststore_alias(alias: &str, truststore: &str, password: &str) -> Vec<String> {
    args([
        "keytool",
        "-delete",
        "-v",
        "-alias",
        alias,
        "-keystore",
        truststore,
        "-storepass",
        password,
    ])
}

/// Bundles the certificate and its private key into a PKCS12 keystore.
pub fn export_pkcs12_keystore(
    certificate: &str,
    private_key: &str,
    keystore: &str,
    password: &str,
) -> Vec<String> {
    let pass = format!("pass:{password}");
    args([
        "openssl",
        "pkcs12",
        "-export",
        "-in",
        certificate,
        "-inkey",
        private_key,
        "-passin",
        &pass,
        "-certfile",
        certificate,
        "-out",
        keystore,
        "-password",
        &pass,
    ])
}

pub fn remove_files(paths: &[&str]) -> Vec<String> {
    let mut command = args(["rm", "-rf"]);
    command.extend(paths.iter().map(|path| path.to_string()));
    command
}

pub fn init_hive_schema(schema_version: &str) -> Vec<String> {
    args([
        SCHEMATOOL_PATH,
        "-dbType",
        "postgres",
        "-initSchemaTo",
        schema_version,
    ])
}

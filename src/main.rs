use std::{fs, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{ContextCompat, Result, WrapErr};
use kz_signer::{
    cms::{SignatureContainer, SignatureEngine, VerifyInput},
    config::Config,
    crypto::{HashAlg, OpensslBackend},
    pki::{
        CertField, Certificate, CertificateValidator, KeyStore, RevocationSource,
        ValidateCertInput, extract,
    },
    telemetry,
    transport::HttpTransport,
    xmldsig::XmlSignatureEngine,
};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "kz-signer")]
#[command(about = "CMS and XML signatures with PKCS#12 identities")]
#[command(version)]
struct Cli {
    /// PKCS#12 keystore (overrides keystore.path, KZ_KEYSTORE__PATH)
    #[arg(long, global = true)]
    keystore: Option<PathBuf>,

    /// Keystore password (overrides keystore.password, KZ_KEYSTORE__PASSWORD)
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hex digest of a file
    Hash {
        file: PathBuf,
        /// sha256 or gost34311
        #[arg(long, default_value = "sha256")]
        alg: String,
    },

    /// Sign a file into a CMS container
    Sign {
        file: PathBuf,
        #[arg(long)]
        detached: bool,
        /// Embed an RFC 3161 timestamp from timestamp.url
        #[arg(long)]
        timestamp: bool,
        /// Write DER here instead of printing PEM
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Verify a CMS container
    Verify {
        signature: PathBuf,
        /// Signed payload of a detached container
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long)]
        check_time: bool,
    },

    /// Add an enveloped signature to an XML document
    SignXml {
        file: PathBuf,
        #[arg(long)]
        timestamp: bool,
    },

    /// Sign the Body of a SOAP envelope with a WS-Security header
    SignWsse {
        file: PathBuf,
        /// wsu:Id given to the Body
        #[arg(long, default_value = "id-body")]
        id: String,
    },

    /// Verify the signature of an XML document
    VerifyXml {
        file: PathBuf,
        #[arg(long)]
        check_time: bool,
    },

    /// Print the certificates carried by a CMS container or signed XML
    Certs { file: PathBuf },

    /// Print certificate fields
    CertInfo {
        certificate: PathBuf,
        /// Comma separated labels such as subject.commonName,notAfter
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },

    /// Check time validity and revocation status of a certificate
    Validate {
        certificate: PathBuf,
        #[arg(long)]
        issuer: Option<PathBuf>,
        #[arg(long)]
        check_time: bool,
        /// OCSP responder (defaults to revocation.ocsp_url)
        #[arg(long, conflicts_with = "crl")]
        ocsp: Option<String>,
        /// CRL URL or file (defaults to revocation.crl_location)
        #[arg(long)]
        crl: Option<String>,
        /// Skip the revocation check
        #[arg(long, conflicts_with_all = ["ocsp", "crl"])]
        no_revocation: bool,
    },
}

fn read(path: &PathBuf) -> Result<Vec<u8>> {
    fs::read(path).wrap_err_with(|| format!("cannot read {}", path.display()))
}

fn read_text(path: &PathBuf) -> Result<String> {
    fs::read_to_string(path).wrap_err_with(|| format!("cannot read {}", path.display()))
}

/// Command line values win over the configuration
fn keystore_credentials(cli: &Cli, config: &Config) -> Result<(PathBuf, String)> {
    let path = cli
        .keystore
        .clone()
        .or_else(|| config.keystore.path.clone())
        .wrap_err("no keystore given; use --keystore or KZ_KEYSTORE__PATH")?;
    let password = cli
        .password
        .clone()
        .or_else(|| {
            config
                .keystore
                .password
                .as_ref()
                .map(|password| password.expose_secret().to_owned())
        })
        .wrap_err("no keystore password given; use --password or KZ_KEYSTORE__PASSWORD")?;
    Ok((path, password))
}

fn open_keystore(cli: &Cli, config: &Config) -> Result<Arc<KeyStore>> {
    let (path, password) = keystore_credentials(cli, config)?;
    let store = KeyStore::new();
    store
        .load(&path, &password)
        .wrap_err_with(|| format!("cannot open keystore {}", path.display()))?;
    Ok(Arc::new(store))
}

fn transport(config: &Config) -> Result<Arc<HttpTransport>> {
    Ok(Arc::new(
        HttpTransport::new(&config.revocation)?.with_timestamp(&config.timestamp),
    ))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    let crypto = Arc::new(OpensslBackend::new());

    match &cli.command {
        Commands::Hash { file, alg } => {
            let alg = HashAlg::from_name(alg)?;
            println!("{}", hex::encode(alg.hash(read(file)?)?));
        }
        Commands::Sign {
            file,
            detached,
            timestamp,
            out,
        } => {
            let engine = SignatureEngine::new(open_keystore(cli, config)?, crypto)
                .with_timestamp_client(transport(config)?);
            let container = engine.sign(&read(file)?, *detached, *timestamp)?;
            match out {
                Some(out) => fs::write(out, container.as_der())
                    .wrap_err_with(|| format!("cannot write {}", out.display()))?,
                None => print!("{}", container.to_pem()),
            }
        }
        Commands::Verify {
            signature,
            data,
            check_time,
        } => {
            let container = SignatureContainer::from_any(&read(signature)?)?;
            let data = data.as_ref().map(read).transpose()?;
            let engine = SignatureEngine::new(Arc::new(KeyStore::new()), crypto);
            let report = engine.verify(&VerifyInput {
                signature: container.as_der(),
                data: data.as_deref(),
                is_detached: container.is_detached()?,
                must_check_cert_time: *check_time,
            })?;
            print_json(&report)?;
        }
        Commands::SignXml { file, timestamp } => {
            let engine = XmlSignatureEngine::new(open_keystore(cli, config)?, crypto)
                .with_timestamp_client(transport(config)?);
            print!("{}", engine.sign_document(&read_text(file)?, *timestamp)?);
        }
        Commands::SignWsse { file, id } => {
            let engine = XmlSignatureEngine::new(open_keystore(cli, config)?, crypto);
            print!("{}", engine.sign_security_header(&read_text(file)?, id)?);
        }
        Commands::VerifyXml { file, check_time } => {
            let engine = XmlSignatureEngine::new(Arc::new(KeyStore::new()), crypto);
            print_json(&engine.verify_document(&read_text(file)?, *check_time)?)?;
        }
        Commands::Certs { file } => {
            let bytes = read(file)?;
            let certificates = if bytes.trim_ascii_start().starts_with(b"<") {
                extract::from_xml(std::str::from_utf8(&bytes)?)?
            } else {
                extract::from_container(SignatureContainer::from_any(&bytes)?.as_der())?
            };
            for certificate in certificates {
                print!("{}", certificate.to_pem());
            }
        }
        Commands::CertInfo {
            certificate,
            fields,
        } => {
            let certificate = Certificate::from_any(&read(certificate)?)?;
            let fields = if fields.is_empty() {
                CertField::ALL.to_vec()
            } else {
                fields
                    .iter()
                    .map(|label| {
                        CertField::from_label(label)
                            .wrap_err_with(|| format!("unknown certificate field '{label}'"))
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            println!("{}", certificate.info(&fields)?);
        }
        Commands::Validate {
            certificate,
            issuer,
            check_time,
            ocsp,
            crl,
            no_revocation,
        } => {
            let source = match (ocsp, crl) {
                _ if *no_revocation => RevocationSource::Nothing,
                (Some(url), _) => RevocationSource::Ocsp { url: url.clone() },
                (None, Some(location)) => RevocationSource::Crl {
                    location: location.clone(),
                },
                (None, None) => match (&config.revocation.ocsp_url, &config.revocation.crl_location) {
                    (Some(url), _) => RevocationSource::Ocsp { url: url.clone() },
                    (None, Some(location)) => RevocationSource::Crl {
                        location: location.clone(),
                    },
                    (None, None) => RevocationSource::Nothing,
                },
            };
            let issuer = match issuer {
                Some(path) => Some(Certificate::from_any(&read(path)?)?),
                None => None,
            };
            let input = ValidateCertInput {
                certificate: Certificate::from_any(&read(certificate)?)?,
                issuer,
                check_cert_time: *check_time,
                source,
            };
            let validator = CertificateValidator::new(transport(config)?);
            print_json(&validator.validate(&input)?)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cli = Cli::parse();
    let config = Config::load().wrap_err("cannot load configuration")?;
    tracing::debug!(revocation = ?config.revocation, "configuration loaded");

    run(&cli, &config)
}

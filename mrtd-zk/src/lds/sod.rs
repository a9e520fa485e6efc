//! EF.SOD: the document security object, a CMS SignedData over the data group hashes.


use rasn::{AsnType, Decode, Encode};
use rasn::types::{Any, Integer, ObjectIdentifier, OctetString, Oid, PrintableString, SequenceOf, SetOf};
use rasn_cms::{ContentInfo, EncapsulatedContentInfo, SignerInfo};
use rasn_pkix::Name;

use crate::der_util::{format_oid, oid_matches};
use crate::lds::{outer_element, FileId, LdsError};
use crate::signature::HashAlgorithm;
use crate::x509::{AlgorithmIdentifier, Certificate};


pub const OID_SIGNED_DATA: &Oid = rasn_cms::CONTENT_SIGNED_DATA;
pub const OID_LDS_SECURITY_OBJECT: &Oid = Oid::const_new(&[2, 23, 136, 1, 1, 1]);


/// CMS `SignedData` with the certificates left encoded, so that each is decoded and kept in its
/// original form.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
pub(crate) struct SignedData {
    pub version: Integer,
    pub digest_algorithms: SetOf<rasn_pkix::AlgorithmIdentifier>,
    pub encap_content_info: EncapsulatedContentInfo,
    /// Implicitly tagged, so reading it as a SEQUENCE OF keeps the stored order.
    #[rasn(tag(0))]
    pub certificates: Option<SequenceOf<Any>>,
    #[rasn(tag(1))]
    pub crls: Option<SequenceOf<Any>>,
    pub signer_infos: SetOf<SignerInfo>,
}
impl SignedData {
    /// Decodes `ContentInfo { id-signedData, [0] SignedData }`.
    ///
    /// BER is accepted, so eContent may be a constructed OCTET STRING.
    pub fn from_content_info(bytes: &[u8]) -> Result<Self, LdsError> {
        let content_info: ContentInfo = rasn::ber::decode(bytes)?;
        if !oid_matches(&content_info.content_type, OID_SIGNED_DATA) {
            return Err(LdsError::UnexpectedContentType { content_type: format_oid(&content_info.content_type) });
        }
        Ok(rasn::ber::decode(content_info.content.as_bytes())?)
    }

    pub fn content_type(&self) -> &ObjectIdentifier {
        &self.encap_content_info.content_type
    }

    /// The eContent octets.
    pub fn content(&self) -> Result<&[u8], LdsError> {
        self.encap_content_info.content.as_deref()
            .ok_or(LdsError::MissingContent)
    }

    /// The embedded certificates; other CertificateChoices are skipped.
    pub fn certificates(&self) -> impl Iterator<Item = &Any> {
        self.certificates.iter()
            .flatten()
            .filter(|c| c.as_bytes().first() == Some(&0x30))
    }
}


/// `LDSSecurityObject` (Doc 9303 Part 10 § 4.6.2.2).
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct LdsSecurityObject {
    version: Integer,
    hash_algorithm: rasn_pkix::AlgorithmIdentifier,
    data_group_hash_values: SequenceOf<DataGroupHash>,
    lds_version_info: Option<LdsVersionInfo>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct DataGroupHash {
    data_group_number: Integer,
    data_group_hash_value: OctetString,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct LdsVersionInfo {
    lds_version: PrintableString,
    unicode_version: PrintableString,
}


/// How a SignerInfo names its certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignerIdentifier {
    IssuerAndSerialNumber { issuer: Name, serial_number: Integer },
    SubjectKeyIdentifier(Vec<u8>),
}
impl From<&rasn_cms::SignerIdentifier> for SignerIdentifier {
    fn from(value: &rasn_cms::SignerIdentifier) -> Self {
        match value {
            rasn_cms::SignerIdentifier::IssuerAndSerialNumber(isn) => Self::IssuerAndSerialNumber {
                issuer: isn.issuer.clone(),
                serial_number: isn.serial_number.clone(),
            },
            rasn_cms::SignerIdentifier::SubjectKeyIdentifier(ski) => Self::SubjectKeyIdentifier(ski.to_vec()),
        }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct SecurityObjectDocument {
    raw: Vec<u8>,
    digest_algorithm: HashAlgorithm,
    data_group_hashes: Vec<(u8, Vec<u8>)>,
    lds_security_object: Vec<u8>,
    signer_identifier: SignerIdentifier,
    signer_digest_algorithm: Option<HashAlgorithm>,
    signed_attributes: Option<Vec<u8>>,
    message_digest: Option<Vec<u8>>,
    signature_algorithm: AlgorithmIdentifier,
    signature: Vec<u8>,
    signer_certificates: Vec<Certificate>,
}
impl SecurityObjectDocument {
    pub fn parse(raw: Vec<u8>) -> Result<Self, LdsError> {
        let element = outer_element(FileId::Sod, &raw)?;
        let signed_data = SignedData::from_content_info(element.content)?;
        if !oid_matches(signed_data.content_type(), OID_LDS_SECURITY_OBJECT) {
            return Err(LdsError::UnexpectedContentType { content_type: format_oid(signed_data.content_type()) });
        }

        let lds_security_object = signed_data.content()?.to_vec();
        let lds_object: LdsSecurityObject = rasn::der::decode(&lds_security_object)?;
        let hash_algorithm = &lds_object.hash_algorithm.algorithm;
        let digest_algorithm = HashAlgorithm::from_oid(hash_algorithm)
            .ok_or_else(|| LdsError::UnsupportedDigest { algorithm: format_oid(hash_algorithm) })?;
        let data_group_hashes = lds_object.data_group_hash_values.iter()
            .map(|entry| {
                let number = u8::try_from(&entry.data_group_number)
                    .map_err(|_| LdsError::DataGroupNumber)?;
                Ok((number, entry.data_group_hash_value.to_vec()))
            })
            .collect::<Result<Vec<_>, LdsError>>()?;

        let signer_certificates = signed_data.certificates()
            .map(|c| Certificate::from_der(c.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let signer_infos = signed_data.signer_infos.to_vec();
        let signer_info = signer_infos.first()
            .ok_or(LdsError::MissingSignerInfo)?;
        let signer_identifier = SignerIdentifier::from(&signer_info.sid);
        let signer_digest_algorithm = HashAlgorithm::from_oid(&signer_info.digest_algorithm.algorithm);

        let mut signed_attributes = None;
        let mut message_digest = None;
        if let Some(attributes) = &signer_info.signed_attrs {
            // the signature covers the DER encoding with the universal SET tag
            signed_attributes = Some(rasn::der::encode(attributes).map_err(LdsError::SignedAttributes)?);
            message_digest = find_message_digest(attributes)?;
        }

        Ok(Self {
            raw,
            digest_algorithm,
            data_group_hashes,
            lds_security_object,
            signer_identifier,
            signer_digest_algorithm,
            signed_attributes,
            message_digest,
            signature_algorithm: AlgorithmIdentifier::from(&signer_info.signature_algorithm),
            signature: signer_info.signature.to_vec(),
            signer_certificates,
        })
    }

    /// The complete encoded file.
    pub fn raw(&self) -> &[u8] { &self.raw }

    /// The algorithm with which the data groups were hashed.
    pub fn digest_algorithm(&self) -> HashAlgorithm { self.digest_algorithm }

    /// Data group numbers and their digests, in the order stored.
    pub fn data_group_hashes(&self) -> &[(u8, Vec<u8>)] { &self.data_group_hashes }

    pub fn data_group_hash(&self, number: u8) -> Option<&[u8]> {
        self.data_group_hashes.iter()
            .find(|(n, _)| *n == number)
            .map(|(_, hash)| hash.as_slice())
    }

    /// The DER encoding of the LDSSecurityObject (the eContent).
    pub fn lds_security_object(&self) -> &[u8] { &self.lds_security_object }

    pub fn signer_identifier(&self) -> &SignerIdentifier { &self.signer_identifier }

    /// The digest algorithm declared in the SignerInfo.
    pub fn signer_digest_algorithm(&self) -> Option<HashAlgorithm> { self.signer_digest_algorithm }

    /// The signed attributes re-tagged as SET, if present.
    pub fn signed_attributes(&self) -> Option<&[u8]> { self.signed_attributes.as_deref() }

    /// The value of the messageDigest signed attribute.
    pub fn message_digest(&self) -> Option<&[u8]> { self.message_digest.as_deref() }

    /// The bytes the signature is computed over.
    pub fn signed_content(&self) -> &[u8] {
        self.signed_attributes.as_deref()
            .unwrap_or(&self.lds_security_object)
    }

    /// The signature algorithm as declared in the SignerInfo.
    pub fn signature_algorithm(&self) -> &AlgorithmIdentifier { &self.signature_algorithm }

    pub fn signature(&self) -> &[u8] { &self.signature }

    pub fn signer_certificates(&self) -> &[Certificate] { &self.signer_certificates }

    /// The embedded certificate the SignerInfo points to, or the first one if none matches.
    pub fn signer_certificate(&self) -> Option<&Certificate> {
        let matching = self.signer_certificates.iter()
            .find(|c| match &self.signer_identifier {
                SignerIdentifier::IssuerAndSerialNumber { issuer, serial_number }
                    => c.issuer() == issuer && c.serial_number() == serial_number,
                SignerIdentifier::SubjectKeyIdentifier(_) => false,
            });
        matching.or_else(|| self.signer_certificates.first())
    }
}


fn find_message_digest(signed_attributes: &rasn_cms::SignedAttributes) -> Result<Option<Vec<u8>>, LdsError> {
    let Some(attribute) = signed_attributes.to_vec().into_iter()
        .find(|a| oid_matches(&a.r#type, rasn_cms::MESSAGE_DIGEST)) else {
        return Ok(None);
    };
    let value = attribute.values.to_vec().into_iter()
        .next()
        .ok_or(LdsError::MissingContent)?;
    let digest: OctetString = rasn::der::decode(value.as_bytes())?;
    Ok(Some(digest.to_vec()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::common_name;

    const SOD_RSA: &[u8] = include_bytes!("../../tests/data/sod_rsa.bin");
    const SOD_ECDSA: &[u8] = include_bytes!("../../tests/data/sod_ecdsa.bin");
    const SOD_CONSTRUCTED: &[u8] = include_bytes!("../../tests/data/sod_constructed.bin");
    const DG1: &[u8] = include_bytes!("../../tests/data/dg1.bin");

    #[test]
    fn decodes_rsa_sod() {
        let sod = SecurityObjectDocument::parse(SOD_RSA.to_vec()).unwrap();
        assert_eq!(sod.digest_algorithm(), HashAlgorithm::Sha256);
        let numbers: Vec<u8> = sod.data_group_hashes().iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 14]);
        assert_eq!(sod.data_group_hash(1), Some(HashAlgorithm::Sha256.digest(DG1).as_slice()));
        assert_eq!(sod.data_group_hash(3), None);

        let signed_attributes = sod.signed_attributes().unwrap();
        assert_eq!(signed_attributes[0], 0x31);
        assert_eq!(sod.signed_content(), signed_attributes);
        assert_eq!(
            sod.message_digest(),
            Some(HashAlgorithm::Sha256.digest(sod.lds_security_object()).as_slice()),
        );
        assert_eq!(sod.signer_digest_algorithm(), Some(HashAlgorithm::Sha256));
        assert_eq!(sod.signature().len(), 256);

        let signer = sod.signer_certificate().unwrap();
        assert_eq!(common_name(signer.subject()).as_deref(), Some("DS Utopia RSA"));
        assert!(matches!(sod.signer_identifier(), SignerIdentifier::IssuerAndSerialNumber { .. }));
    }

    #[test]
    fn decodes_ecdsa_sod() {
        let sod = SecurityObjectDocument::parse(SOD_ECDSA.to_vec()).unwrap();
        assert_eq!(sod.signature_algorithm().parameters, None);
        assert_eq!(sod.signer_certificates().len(), 1);
    }

    #[test]
    fn decodes_constructed_econtent() {
        // eContent split into 64-byte primitive segments inside a constructed OCTET STRING
        let sod = SecurityObjectDocument::parse(SOD_CONSTRUCTED.to_vec()).unwrap();
        let reference = SecurityObjectDocument::parse(SOD_RSA.to_vec()).unwrap();
        assert_eq!(sod.lds_security_object(), reference.lds_security_object());
        assert_eq!(sod.data_group_hashes(), reference.data_group_hashes());
        assert_eq!(sod.signed_attributes(), reference.signed_attributes());
        assert_eq!(sod.signature(), reference.signature());
        assert_eq!(sod.signer_certificate().map(|c| c.raw()), reference.signer_certificate().map(|c| c.raw()));
    }

    #[test]
    fn signed_data_requires_signed_data_content() {
        // ContentInfo { id-data, [0] OCTET STRING {} }
        let data = [0x30, 0x0F, 0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01, 0xA0, 0x02, 0x04, 0x00];
        assert!(matches!(
            SignedData::from_content_info(&data),
            Err(LdsError::UnexpectedContentType { content_type }) if content_type == "1.2.840.113549.1.7.1",
        ));
    }

    #[test]
    fn rejects_wrong_content() {
        assert!(SecurityObjectDocument::parse(SOD_RSA[..SOD_RSA.len()-1].to_vec()).is_err());
        assert!(matches!(
            SecurityObjectDocument::parse(DG1.to_vec()),
            Err(LdsError::WrongFileTag { .. }),
        ));
    }
}

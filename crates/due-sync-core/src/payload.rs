//! Typed shapes of the registry's JSON documents.
//!
//! Every leaf is optional: the registry omits or nulls fields freely, and a
//! missing field must never fail a whole declaration. Identifier-like leaves
//! whose JSON type varies between endpoints are kept as raw [`Value`]s.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Full declaration detail (`GET /numero-da-due/{numero}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DuePayload {
    pub numero: Option<String>,
    pub chave_de_acesso: Option<String>,
    pub data_de_registro: Option<String>,
    pub bloqueio: Option<bool>,
    pub canal: Option<String>,
    pub embarque_em_recinto_alfandegado: Option<bool>,
    pub despacho_em_recinto_alfandegado: Option<bool>,
    pub forma_de_exportacao: Option<String>,
    pub impedido_de_embarque: Option<bool>,
    pub informacoes_complementares: Option<String>,
    pub ruc: Option<String>,
    pub situacao: Option<String>,
    pub situacao_do_tratamento_administrativo: Option<String>,
    pub tipo: Option<String>,
    pub tratamento_prioritario: Option<bool>,
    #[serde(rename = "responsavelPeloACD")]
    pub responsavel_pelo_acd: Option<String>,
    pub despacho_em_recinto_domiciliar: Option<bool>,
    pub data_de_criacao: Option<String>,
    #[serde(rename = "dataDoCCE")]
    pub data_do_cce: Option<String>,
    pub data_do_desembaraco: Option<String>,
    pub data_do_acd: Option<String>,
    pub data_da_averbacao: Option<String>,
    pub valor_total_mercadoria: Option<f64>,
    pub inclusao_nota_fiscal: Option<bool>,
    pub exigencia_ativa: Option<bool>,
    pub consorciada: Option<bool>,
    pub dat: Option<bool>,
    pub oea: Option<bool>,
    pub declarante: Option<Party>,
    pub moeda: Option<CodeRef>,
    pub pais_importador: Option<CodeRef>,
    pub recinto_aduaneiro_de_despacho: Option<CodeRef>,
    pub recinto_aduaneiro_de_embarque: Option<CodeRef>,
    pub unidade_local_de_despacho: Option<CodeRef>,
    pub unidade_local_de_embarque: Option<CodeRef>,
    pub declaracao_tributaria: Option<TaxDeclaration>,
    #[serde(deserialize_with = "null_as_default")]
    pub eventos_do_historico: Vec<HistoryEvent>,
    #[serde(deserialize_with = "null_as_default")]
    pub itens: Vec<Item>,
    #[serde(deserialize_with = "null_as_default")]
    pub situacoes_da_carga: Vec<CargoSituation>,
    #[serde(deserialize_with = "null_as_default")]
    pub solicitacoes: Vec<Request>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeRef {
    pub codigo: Option<Value>,
    pub descricao: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Nationality {
    pub codigo: Option<Value>,
    pub nome: Option<String>,
    pub nome_resumido: Option<String>,
}

/// Declarant or exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Party {
    pub numero_do_documento: Option<String>,
    pub tipo_do_documento: Option<String>,
    pub nome: Option<String>,
    pub estrangeiro: Option<bool>,
    pub nacionalidade: Option<Nationality>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryEvent {
    pub data_e_hora_do_evento: Option<String>,
    pub evento: Option<String>,
    pub responsavel: Option<String>,
    pub informacoes_adicionais: Option<String>,
    pub detalhes: Option<String>,
    pub motivo: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Ncm {
    pub codigo: Option<Value>,
    pub descricao: Option<String>,
    pub unidade_medida_estatistica: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TemporaryExport {
    pub temporaria: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Framework {
    pub codigo: Option<Value>,
    pub data_registro: Option<String>,
    pub descricao: Option<String>,
    pub grupo: Option<Value>,
    pub tipo: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Item {
    pub numero: Option<i64>,
    pub quantidade_na_unidade_estatistica: Option<f64>,
    pub peso_liquido_total: Option<f64>,
    pub valor_da_mercadoria_na_condicao_de_venda: Option<f64>,
    pub valor_da_mercadoria_no_local_de_embarque: Option<f64>,
    pub valor_da_mercadoria_no_local_de_embarque_em_reais: Option<f64>,
    pub valor_da_mercadoria_na_condicao_de_venda_em_reais: Option<f64>,
    pub data_de_conversao: Option<String>,
    pub descricao_da_mercadoria: Option<String>,
    pub unidade_comercializada: Option<String>,
    pub nome_importador: Option<String>,
    pub endereco_importador: Option<String>,
    pub valor_total_calculado_item: Option<f64>,
    pub quantidade_na_unidade_comercializada: Option<f64>,
    pub ncm: Option<Ncm>,
    pub exportador: Option<Party>,
    pub codigo_condicao_venda: Option<CodeRef>,
    pub exportacao_temporaria: Option<TemporaryExport>,
    #[serde(deserialize_with = "null_as_default")]
    pub lista_de_enquadramentos: Vec<Framework>,
    #[serde(deserialize_with = "null_as_default")]
    pub lista_pais_destino: Vec<CodeRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CargoSituation {
    pub codigo: Option<Value>,
    pub descricao: Option<String>,
    pub carga_operada: Option<bool>,
}

/// Rectification or cancellation request lodged against a declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    pub tipo_solicitacao: Option<String>,
    pub data_da_solicitacao: Option<String>,
    pub usuario_responsavel: Option<String>,
    pub codigo_do_status_da_solicitacao: Option<Value>,
    pub status_da_solicitacao: Option<String>,
    pub data_de_apreciacao: Option<String>,
    pub motivo: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaxDeclaration {
    pub divergente: Option<bool>,
    #[serde(deserialize_with = "null_as_default")]
    pub compensacoes: Vec<TaxCompensation>,
    #[serde(deserialize_with = "null_as_default")]
    pub recolhimentos: Vec<TaxPayment>,
    #[serde(deserialize_with = "null_as_default")]
    pub contestacoes: Vec<TaxDispute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaxCompensation {
    pub data_do_registro: Option<String>,
    pub numero_da_declaracao: Option<String>,
    pub valor_compensado: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaxPayment {
    pub data_do_pagamento: Option<String>,
    pub data_do_registro: Option<String>,
    pub valor_da_multa: Option<f64>,
    pub valor_do_imposto_recolhido: Option<f64>,
    pub valor_do_juros_mora: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaxDispute {
    pub data_do_registro: Option<String>,
    pub motivo: Option<String>,
    pub status: Option<String>,
    pub data_de_apreciacao: Option<String>,
    pub observacao: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ActItem {
    pub numero: Option<Value>,
    pub ncm: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Beneficiary {
    pub cnpj: Option<String>,
}

/// Drawback concessional act, suspension or exemption flavour.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcessionAct {
    pub numero: Option<Value>,
    pub tipo: Option<CodeRef>,
    pub item: Option<ActItem>,
    pub beneficiario: Option<Beneficiary>,
    pub quantidade_exportada: Option<f64>,
    pub valor_com_cobertura_cambial: Option<f64>,
    pub valor_sem_cobertura_cambial: Option<f64>,
    #[serde(rename = "itemDeDUE")]
    pub item_de_due: Option<ActItem>,
}

/// Fiscal requirement raised against a declaration. The endpoint has served
/// both camelCase and legacy field names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FiscalRequirement {
    #[serde(alias = "numeroExigencia")]
    pub numero: Option<Value>,
    #[serde(alias = "tipoExigencia")]
    pub tipo: Option<String>,
    #[serde(alias = "data_criacao")]
    pub data_criacao: Option<String>,
    #[serde(alias = "data_limite")]
    pub data_limite: Option<String>,
    pub status: Option<String>,
    #[serde(alias = "orgao_responsavel")]
    pub orgao_responsavel: Option<String>,
    pub descricao: Option<String>,
    #[serde(alias = "valor_exigido")]
    pub valor_exigido: Option<f64>,
    #[serde(alias = "valor_pago")]
    pub valor_pago: Option<f64>,
    #[serde(alias = "observacao")]
    pub observacoes: Option<String>,
}

/// Optional per-declaration collections. `None` means the endpoint was not
/// requested or gave no usable answer, so stored rows stay as they are;
/// `Some(vec![])` means it answered with nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubResources {
    pub suspension_acts: Option<Vec<ConcessionAct>>,
    pub exemption_acts: Option<Vec<ConcessionAct>>,
    pub fiscal_requirements: Option<Vec<FiscalRequirement>>,
}

/// Entry of the invoice lookup response (`GET ?nota-fiscal={key}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LookupEntry {
    /// Declaration number.
    pub rel: Option<String>,
    pub href: Option<String>,
}
